//! Typed calls into the CMS command-line tool.

use log::{debug, info};
use std::path::Path;

use crate::command::CommandOutput;
use crate::error::{MigrateError, Result};
use crate::site::Site;

pub struct Wp<'a> {
    site: &'a Site,
}

impl<'a> Wp<'a> {
    pub fn new(site: &'a Site) -> Self {
        Self { site }
    }

    fn args(&self, command: &[&str]) -> Vec<String> {
        let mut args = vec![
            format!("--path={}", self.site.root.display()),
            "--skip-plugins".to_string(),
            "--skip-themes".to_string(),
        ];
        args.extend(command.iter().map(|s| s.to_string()));
        args
    }

    /// Run and return the raw output whatever the exit status.
    pub fn exec(&self, command: &[&str]) -> Result<CommandOutput> {
        self.site.runner().exec(&self.site.wp_bin, &self.args(command))
    }

    fn run(&self, command: &[&str]) -> Result<CommandOutput> {
        let label = format!("wp {}", command.first().copied().unwrap_or_default());
        self.exec(command)?.check(&label)
    }

    fn lines(&self, command: &[&str]) -> Result<Vec<String>> {
        Ok(self
            .run(command)?
            .stdout_text()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn is_installed(&self) -> Result<bool> {
        Ok(self.exec(&["core", "is-installed"])?.success())
    }

    pub fn maintenance(&self, enable: bool) -> Result<()> {
        let action = if enable { "activate" } else { "deactivate" };
        self.run(&["maintenance-mode", action])?;
        info!(
            "Maintenance mode {} on {}",
            if enable { "enabled" } else { "disabled" },
            self.site.side
        );
        Ok(())
    }

    pub fn db_export(&self, file: &Path) -> Result<()> {
        let file = file.display().to_string();
        self.run(&["db", "export", &file]).map(|_| ())
    }

    pub fn db_import(&self, file: &Path) -> Result<()> {
        let file = file.display().to_string();
        self.run(&["db", "import", &file]).map(|_| ())
    }

    pub fn db_reset(&self) -> Result<()> {
        self.run(&["db", "reset", "--yes"]).map(|_| ())
    }

    /// Every table in the database, whatever its prefix.
    pub fn db_tables(&self) -> Result<Vec<String>> {
        self.lines(&["db", "tables", "--all-tables"])
    }

    /// Database size in bytes.
    pub fn db_size(&self) -> Result<u64> {
        let out = self.run(&["db", "size", "--size_format=b"])?.stdout_text();
        let digits: String = out.trim().chars().take_while(char::is_ascii_digit).collect();
        digits.parse().map_err(|_| {
            MigrateError::Preflight(format!("could not read database size from '{}'", out.trim()))
        })
    }

    pub fn config_get(&self, name: &str) -> Result<String> {
        Ok(self.run(&["config", "get", name])?.stdout_text())
    }

    pub fn config_set_variable(&self, name: &str, value: &str) -> Result<()> {
        self.run(&["config", "set", name, value, "--type=variable"])
            .map(|_| ())
    }

    pub fn option_get(&self, name: &str) -> Result<String> {
        Ok(self.run(&["option", "get", name])?.stdout_text())
    }

    pub fn active_plugins(&self) -> Result<Vec<String>> {
        self.lines(&["plugin", "list", "--status=active", "--field=name"])
    }

    pub fn themes(&self) -> Result<Vec<String>> {
        self.lines(&["theme", "list", "--field=name"])
    }

    pub fn search_replace(&self, old: &str, new: &str) -> Result<()> {
        debug!("search-replace '{}' -> '{}' on {}", old, new, self.site.side);
        self.run(&[
            "search-replace",
            old,
            new,
            "--all-tables",
            "--skip-columns=guid",
            "--precise",
        ])
        .map(|_| ())
    }

    pub fn cache_flush(&self) -> Result<()> {
        self.run(&["cache", "flush"]).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandRunner;
    use crate::error::MigrateError;
    use crate::site::Side;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::sync::Arc;

    struct Recorder {
        calls: Arc<Mutex<Vec<Vec<String>>>>,
        reply: CommandOutput,
    }

    impl CommandRunner for Recorder {
        fn exec(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
            let mut call = vec![program.to_string()];
            call.extend(args.iter().cloned());
            self.calls.lock().push(call);
            Ok(self.reply.clone())
        }

        fn exec_with_input(&self, program: &str, args: &[String], _input: &[u8]) -> Result<CommandOutput> {
            self.exec(program, args)
        }

        fn describe(&self) -> String {
            "recorder".to_string()
        }
    }

    fn site(reply: CommandOutput) -> (Site, Arc<Mutex<Vec<Vec<String>>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let runner = Recorder {
            calls: calls.clone(),
            reply,
        };
        let site = Site::new(
            Side::Destination,
            PathBuf::from("/srv/site"),
            "wp".to_string(),
            Box::new(runner),
        );
        (site, calls)
    }

    #[test]
    fn test_commands_carry_site_path() {
        let (site, calls) = site(CommandOutput::ok("wp_options\nwp_posts\n\n"));
        let tables = Wp::new(&site).db_tables().unwrap();
        assert_eq!(tables, vec!["wp_options", "wp_posts"]);

        let call = calls.lock()[0].clone();
        assert_eq!(call[0], "wp");
        assert_eq!(call[1], "--path=/srv/site");
        assert_eq!(&call[4..], &["db", "tables", "--all-tables"]);
    }

    #[test]
    fn test_failure_maps_to_command_error() {
        let (site, _) = site(CommandOutput::failed(1, "Error: no database"));
        let err = Wp::new(&site).db_export(Path::new("/tmp/x.sql")).unwrap_err();
        match err {
            MigrateError::Command { command, status, stderr } => {
                assert_eq!(command, "wp db");
                assert_eq!(status, 1);
                assert_eq!(stderr, "Error: no database");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!Wp::new(&site).is_installed().unwrap());
    }

    #[test]
    fn test_db_size_parses_bytes() {
        let (site, _) = site(CommandOutput::ok("123456B\n"));
        assert_eq!(Wp::new(&site).db_size().unwrap(), 123456);
    }

    #[test]
    fn test_unreadable_db_size_is_an_error() {
        for reply in ["", "Error establishing a database connection", "B123"] {
            let (site, _) = site(CommandOutput::ok(reply));
            let err = Wp::new(&site).db_size().unwrap_err();
            assert!(matches!(err, MigrateError::Preflight(_)), "{reply}: {err:?}");
        }
    }
}
