use anyhow::Context;
use log::debug;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::command::split_opts;
use crate::error::{MigrateError, Result};
use crate::url_alignment::SearchReplacePair;

pub const ENV_SSH_OPTS: &str = "WP_MIGRATE_SSH_OPTS";
pub const ENV_RSYNC_OPTS: &str = "WP_MIGRATE_RSYNC_OPTS";
pub const ENV_WP_BIN: &str = "WP_MIGRATE_WP_BIN";
pub const DEFAULT_WP_BIN: &str = "wp";

/// Raw command-line values, before profile and environment defaults.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub dest: Option<String>,
    pub dest_path: Option<PathBuf>,
    pub source_path: Option<PathBuf>,
    pub archive: Option<PathBuf>,
    pub archive_format: Option<String>,
    pub rollback: bool,
    pub rollback_backup: Option<String>,
    pub backup_only: bool,
    pub dry_run: bool,
    pub yes: bool,
    pub dest_url: Option<String>,
    pub search_replace: Vec<String>,
    pub rsync_opts: Option<String>,
    pub ssh_opts: Option<String>,
    pub no_gzip: bool,
    pub preserve_dest_plugins: bool,
    pub config: Option<PathBuf>,
    pub interactive: bool,
}

/// Defaults loaded from a JSON profile. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Profile {
    pub dest: Option<String>,
    pub dest_path: Option<PathBuf>,
    pub source_path: Option<PathBuf>,
    pub dest_url: Option<String>,
    pub search_replace: Vec<String>,
    pub rsync_opts: Option<String>,
    pub ssh_opts: Option<String>,
    pub wp_bin: Option<String>,
    pub no_gzip: Option<bool>,
    pub preserve_dest_plugins: Option<bool>,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config profile: {}", path.display()))?;
        serde_json::from_str(&content).map_err(|e| {
            MigrateError::UserInput(format!("invalid config profile {}: {}", path.display(), e))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Local installation pushed to a remote host.
    Push {
        source: PathBuf,
        host: String,
        dest: PathBuf,
    },
    ArchiveImport {
        archive: PathBuf,
        format: Option<String>,
        site: PathBuf,
    },
    Rollback {
        site: PathBuf,
        snapshot: Option<String>,
    },
    BackupOnly {
        site: PathBuf,
    },
}

impl Mode {
    /// Pick exactly one mode from the mode-selecting values. `profile_dest` is
    /// only a default for push and never selects it.
    pub fn resolve(opts: &Options, profile: &Profile) -> Result<Mode> {
        let selected: Vec<&str> = [
            (opts.dest.is_some(), "--dest"),
            (opts.archive.is_some(), "--archive"),
            (opts.rollback, "--rollback"),
            (opts.backup_only, "--backup-only"),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .map(|(_, flag)| *flag)
        .collect();

        if selected.len() > 1 {
            return Err(MigrateError::UserInput(format!(
                "{} cannot be combined",
                selected.join(" and ")
            )));
        }
        if opts.archive_format.is_some() && opts.archive.is_none() {
            return Err(MigrateError::UserInput(
                "--archive-format requires --archive".to_string(),
            ));
        }
        if opts.rollback_backup.is_some() && !opts.rollback {
            return Err(MigrateError::UserInput(
                "--rollback-backup requires --rollback".to_string(),
            ));
        }

        let cwd = || PathBuf::from(".");
        let local_site = || {
            opts.dest_path
                .clone()
                .or_else(|| profile.dest_path.clone())
                .unwrap_or_else(cwd)
        };

        let dest = opts.dest.clone().or_else(|| {
            if selected.is_empty() {
                profile.dest.clone()
            } else {
                None
            }
        });

        match selected.first().copied() {
            Some("--archive") => Ok(Mode::ArchiveImport {
                archive: opts.archive.clone().unwrap_or_default(),
                format: opts.archive_format.clone(),
                site: local_site(),
            }),
            Some("--rollback") => Ok(Mode::Rollback {
                site: local_site(),
                snapshot: opts.rollback_backup.clone(),
            }),
            Some("--backup-only") => Ok(Mode::BackupOnly { site: local_site() }),
            _ => {
                let Some(host) = dest else {
                    return Err(MigrateError::UserInput(
                        "nothing to do: pass --dest, --archive, --rollback or --backup-only".to_string(),
                    ));
                };
                let dest_path = opts
                    .dest_path
                    .clone()
                    .or_else(|| profile.dest_path.clone())
                    .ok_or_else(|| {
                        MigrateError::UserInput("--dest requires --dest-path".to_string())
                    })?;
                Ok(Mode::Push {
                    source: opts
                        .source_path
                        .clone()
                        .or_else(|| profile.source_path.clone())
                        .unwrap_or_else(cwd),
                    host,
                    dest: dest_path,
                })
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mode::Push { .. } => "push",
            Mode::ArchiveImport { .. } => "archive import",
            Mode::Rollback { .. } => "rollback",
            Mode::BackupOnly { .. } => "backup",
        }
    }
}

/// `OLD=NEW`, split at the first `=`.
pub fn parse_search_replace(raw: &str) -> Result<SearchReplacePair> {
    match raw.split_once('=') {
        Some((old, new)) if !old.is_empty() => Ok(SearchReplacePair::new(old, new)),
        _ => Err(MigrateError::UserInput(format!(
            "--search-replace expects OLD=NEW, got '{raw}'"
        ))),
    }
}

/// Fully resolved run configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: Mode,
    pub dry_run: bool,
    pub assume_yes: bool,
    pub interactive: bool,
    pub gzip: bool,
    pub preserve_dest_plugins: bool,
    pub dest_url: Option<String>,
    pub search_replace: Vec<SearchReplacePair>,
    pub rsync_opts: Vec<String>,
    pub ssh_opts: Vec<String>,
    pub wp_bin: String,
}

impl Settings {
    /// CLI values win over the profile, the profile over the environment.
    pub fn resolve(opts: Options, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let profile = match &opts.config {
            Some(path) => Profile::load(path)?,
            None => Profile::default(),
        };
        let mode = Mode::resolve(&opts, &profile)?;

        let raw_pairs = if opts.search_replace.is_empty() {
            &profile.search_replace
        } else {
            &opts.search_replace
        };
        let search_replace = raw_pairs
            .iter()
            .map(|raw| parse_search_replace(raw))
            .collect::<Result<Vec<_>>>()?;

        let rsync_opts = opts
            .rsync_opts
            .or(profile.rsync_opts)
            .or_else(|| env(ENV_RSYNC_OPTS))
            .map(|s| split_opts(&s))
            .unwrap_or_default();
        let ssh_opts = opts
            .ssh_opts
            .or(profile.ssh_opts)
            .or_else(|| env(ENV_SSH_OPTS))
            .map(|s| split_opts(&s))
            .unwrap_or_default();
        let wp_bin = profile
            .wp_bin
            .or_else(|| env(ENV_WP_BIN))
            .unwrap_or_else(|| DEFAULT_WP_BIN.to_string());

        let settings = Settings {
            mode,
            dry_run: opts.dry_run,
            assume_yes: opts.yes,
            interactive: opts.interactive,
            gzip: !(opts.no_gzip || profile.no_gzip.unwrap_or(false)),
            preserve_dest_plugins: opts.preserve_dest_plugins
                || profile.preserve_dest_plugins.unwrap_or(false),
            dest_url: opts.dest_url.or(profile.dest_url),
            search_replace,
            rsync_opts,
            ssh_opts,
            wp_bin,
        };
        debug!("Resolved settings: {:?}", settings);
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_conflicting_modes_rejected() {
        let opts = Options {
            dest: Some("web1".into()),
            archive: Some("backup.zip".into()),
            ..Options::default()
        };
        let err = Settings::resolve(opts, no_env).unwrap_err();
        assert!(matches!(err, MigrateError::UserInput(_)));
        assert!(err.to_string().contains("--dest and --archive"));

        let opts = Options {
            rollback: true,
            archive: Some("backup.zip".into()),
            ..Options::default()
        };
        assert!(Settings::resolve(opts, no_env).is_err());
        assert!(Settings::resolve(Options::default(), no_env).is_err());
    }

    #[test]
    fn test_dependent_flags() {
        let opts = Options {
            archive_format: Some("jetpack".into()),
            backup_only: true,
            ..Options::default()
        };
        assert!(Settings::resolve(opts, no_env).is_err());

        let opts = Options {
            dest: Some("web1".into()),
            ..Options::default()
        };
        let err = Settings::resolve(opts, no_env).unwrap_err();
        assert!(err.to_string().contains("--dest-path"));
    }

    #[test]
    fn test_archive_mode_defaults_to_current_dir() {
        let opts = Options {
            archive: Some("site.tar.gz".into()),
            archive_format: Some("backwpup".into()),
            ..Options::default()
        };
        let settings = Settings::resolve(opts, no_env).unwrap();
        assert_eq!(
            settings.mode,
            Mode::ArchiveImport {
                archive: "site.tar.gz".into(),
                format: Some("backwpup".into()),
                site: ".".into(),
            }
        );
        assert!(settings.gzip);
        assert_eq!(settings.wp_bin, "wp");
    }

    #[test]
    fn test_precedence_cli_profile_env() {
        let temp_dir = TempDir::new().unwrap();
        let profile = temp_dir.path().join("profile.json");
        fs::write(
            &profile,
            r#"{"dest": "web1", "dest_path": "/srv/site", "ssh_opts": "-p 2222", "search_replace": ["a=b"], "no_gzip": true}"#,
        )
        .unwrap();

        let opts = Options {
            config: Some(profile),
            rsync_opts: Some("--bwlimit=10".into()),
            ..Options::default()
        };
        let env = |key: &str| match key {
            ENV_SSH_OPTS => Some("-p 22".to_string()),
            ENV_WP_BIN => Some("/usr/local/bin/wp".to_string()),
            ENV_RSYNC_OPTS => Some("--ignored".to_string()),
            _ => None,
        };
        let settings = Settings::resolve(opts, env).unwrap();

        assert_eq!(
            settings.mode,
            Mode::Push {
                source: ".".into(),
                host: "web1".into(),
                dest: "/srv/site".into(),
            }
        );
        assert_eq!(settings.ssh_opts, vec!["-p", "2222"]);
        assert_eq!(settings.rsync_opts, vec!["--bwlimit=10"]);
        assert_eq!(settings.wp_bin, "/usr/local/bin/wp");
        assert_eq!(settings.search_replace, vec![SearchReplacePair::new("a", "b")]);
        assert!(!settings.gzip);
    }

    #[test]
    fn test_search_replace_parsing() {
        assert_eq!(
            parse_search_replace("http://a=b=c").unwrap(),
            SearchReplacePair::new("http://a", "b=c")
        );
        assert!(parse_search_replace("=x").is_err());
        assert!(parse_search_replace("nothing").is_err());
    }
}
