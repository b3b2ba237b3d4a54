//! Pre-destructive snapshots and their restoration.
//!
//! Database snapshots are exports under `<site>/db-backups/`, each with a JSON
//! manifest beside it. Content snapshots are the live content directory renamed
//! to a `wp-content.backup-<stamp>` sibling. The configuration file is copied
//! to `db-backups/<stamp>.wp-config.php`, since reconciliation edits it.

use chrono::{DateTime, Local, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MigrateError, Result};
use crate::site::{Site, SiteFs};
use crate::table_prefix::CONFIG_FILE;
use crate::wp::Wp;

pub const DB_BACKUP_DIR: &str = "db-backups";
pub const CONTENT_BACKUP_PREFIX: &str = "wp-content.backup-";
const MANIFEST_SUFFIX: &str = ".json";
const CONFIG_SUFFIX: &str = ".wp-config.php";

/// Run timestamp used to key one run's snapshots.
pub fn stamp_now() -> String {
    Local::now().format("%Y%m%d-%H%M%S").to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotKind {
    Database,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SnapshotStatus {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub created_at: DateTime<Utc>,
    pub kind: SnapshotKind,
    pub stamp: String,
    pub source: PathBuf,
    pub file: PathBuf,
    pub compressed: bool,
    pub status: SnapshotStatus,
    pub digest: Option<String>,
}

/// The snapshots of one run, matched by stamp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotSet {
    pub stamp: String,
    pub database: Option<PathBuf>,
    pub content: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

fn manifest_path(snapshot: &Path) -> PathBuf {
    let mut name = snapshot.as_os_str().to_os_string();
    name.push(MANIFEST_SUFFIX);
    PathBuf::from(name)
}

/// `20240101-120000.sql.gz` -> `20240101-120000`
fn db_stamp(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(".sql.gz")
        .or_else(|| file_name.strip_suffix(".sql"))
}

pub struct BackupLedger<'a> {
    site: &'a Site,
    pub gzip: bool,
}

impl<'a> BackupLedger<'a> {
    pub fn new(site: &'a Site) -> Self {
        Self { site, gzip: true }
    }

    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    pub fn db_dir(&self) -> PathBuf {
        self.site.root.join(DB_BACKUP_DIR)
    }

    /// Where an incoming dump waits for import. It sits with the snapshots,
    /// outside the webroot, and is never listed as one.
    pub fn staged_import(&self, stamp: &str) -> PathBuf {
        self.db_dir().join(format!("{stamp}.import.staged"))
    }

    fn write_manifest(&self, fs: &dyn SiteFs, manifest: &SnapshotManifest) -> Result<()> {
        let json = serde_json::to_vec_pretty(manifest)
            .map_err(|e| MigrateError::Other(anyhow::anyhow!("Failed to encode snapshot manifest: {e}")))?;
        fs.write(&manifest_path(&manifest.file), &json)
    }

    pub fn read_manifest(&self, snapshot: &Path) -> Result<Option<SnapshotManifest>> {
        let fs = self.site.fs();
        let path = manifest_path(snapshot);
        if !fs.exists(&path)? {
            return Ok(None);
        }
        let manifest = serde_json::from_slice(&fs.read(&path)?).map_err(|e| {
            MigrateError::Other(anyhow::anyhow!(
                "Failed to parse snapshot manifest {}: {e}",
                path.display()
            ))
        })?;
        Ok(Some(manifest))
    }

    /// Export the database into `db-backups/<stamp>.sql[.gz]`.
    pub fn snapshot_database(&self, stamp: &str) -> Result<PathBuf> {
        let fs = self.site.fs();
        let dir = self.db_dir();
        fs.create_dir_all(&dir)?;

        let plain = dir.join(format!("{stamp}.sql"));
        let file = if self.gzip {
            dir.join(format!("{stamp}.sql.gz"))
        } else {
            plain.clone()
        };
        let mut manifest = SnapshotManifest {
            created_at: Utc::now(),
            kind: SnapshotKind::Database,
            stamp: stamp.to_string(),
            source: self.site.root.clone(),
            file: file.clone(),
            compressed: self.gzip,
            status: SnapshotStatus::InProgress,
            digest: None,
        };
        self.write_manifest(fs.as_ref(), &manifest)?;

        Wp::new(self.site).db_export(&plain)?;
        if self.gzip {
            fs.gzip(&plain, &file)?;
        }

        manifest.digest = Some(fs.digest(&file)?);
        manifest.status = SnapshotStatus::Completed;
        self.write_manifest(fs.as_ref(), &manifest)?;
        info!("Database snapshot written to {}", file.display());
        Ok(file)
    }

    /// Rename the content directory aside. `None` when there is nothing to move.
    pub fn snapshot_content_tree(&self, stamp: &str) -> Result<Option<PathBuf>> {
        let fs = self.site.fs();
        let content = self.site.content_dir();
        if !fs.is_dir(&content)? {
            info!("No content directory at {}, nothing to snapshot", content.display());
            return Ok(None);
        }
        let aside = self.site.root.join(format!("{CONTENT_BACKUP_PREFIX}{stamp}"));
        if fs.exists(&aside)? {
            return Err(MigrateError::Preflight(format!(
                "content snapshot {} already exists",
                aside.display()
            )));
        }
        fs.rename(&content, &aside)?;
        info!("Content directory moved aside to {}", aside.display());
        Ok(Some(aside))
    }

    /// Copy the installation's configuration file. `None` when there is none.
    pub fn snapshot_config(&self, stamp: &str) -> Result<Option<PathBuf>> {
        let fs = self.site.fs();
        let live = self.site.root.join(CONFIG_FILE);
        if !fs.exists(&live)? {
            warn!("No {} at {}, not snapshotted", CONFIG_FILE, self.site.root.display());
            return Ok(None);
        }
        let dir = self.db_dir();
        fs.create_dir_all(&dir)?;
        let copy = dir.join(format!("{stamp}{CONFIG_SUFFIX}"));
        fs.write(&copy, &fs.read(&live)?)?;
        debug!("{} copied to {}", CONFIG_FILE, copy.display());
        Ok(Some(copy))
    }

    /// Copy the content directory to the snapshot location, leaving the live
    /// tree in place. Used when no destructive step follows.
    pub fn copy_content_tree(&self, stamp: &str) -> Result<Option<PathBuf>> {
        let fs = self.site.fs();
        let content = self.site.content_dir();
        if !fs.is_dir(&content)? {
            info!("No content directory at {}, nothing to copy", content.display());
            return Ok(None);
        }
        let copy = self.site.root.join(format!("{CONTENT_BACKUP_PREFIX}{stamp}"));
        if fs.exists(&copy)? {
            return Err(MigrateError::Preflight(format!(
                "content snapshot {} already exists",
                copy.display()
            )));
        }
        fs.copy_recursive(&content, &copy)?;
        info!("Content directory copied to {}", copy.display());
        Ok(Some(copy))
    }

    /// Every snapshot on disk grouped by stamp, newest first.
    pub fn list(&self) -> Result<Vec<SnapshotSet>> {
        let fs = self.site.fs();
        let mut sets: Vec<SnapshotSet> = Vec::new();

        fn entry<'s>(sets: &'s mut Vec<SnapshotSet>, stamp: &str) -> &'s mut SnapshotSet {
            let idx = match sets.iter().position(|s| s.stamp == stamp) {
                Some(idx) => idx,
                None => {
                    sets.push(SnapshotSet {
                        stamp: stamp.to_string(),
                        ..SnapshotSet::default()
                    });
                    sets.len() - 1
                }
            };
            &mut sets[idx]
        }

        let db_dir = self.db_dir();
        for name in fs.list_dir(&db_dir)? {
            if let Some(stamp) = db_stamp(&name) {
                entry(&mut sets, stamp).database = Some(db_dir.join(&name));
            } else if let Some(stamp) = name.strip_suffix(CONFIG_SUFFIX) {
                entry(&mut sets, stamp).config = Some(db_dir.join(&name));
            }
        }
        for name in fs.list_dir(&self.site.root)? {
            if let Some(stamp) = name.strip_prefix(CONTENT_BACKUP_PREFIX) {
                entry(&mut sets, stamp).content = Some(self.site.root.join(&name));
            }
        }

        sets.sort_by(|a, b| b.stamp.cmp(&a.stamp));
        Ok(sets)
    }

    /// The latest snapshot set, or the one whose stamp or file name is `name`.
    pub fn find(&self, name: Option<&str>) -> Result<SnapshotSet> {
        let sets = self.list()?;
        let found = match name {
            None => sets.first().cloned(),
            Some(name) => sets
                .iter()
                .find(|s| {
                    s.stamp == name
                        || [&s.database, &s.content, &s.config].iter().any(|p| {
                            p.as_deref()
                                .and_then(Path::file_name)
                                .is_some_and(|f| f == name)
                        })
                })
                .cloned(),
        };
        found.ok_or_else(|| {
            let available: Vec<&str> = sets.iter().map(|s| s.stamp.as_str()).collect();
            MigrateError::UserInput(match name {
                Some(name) => format!(
                    "no snapshot named '{}' under {} (available: {})",
                    name,
                    self.site.root.display(),
                    if available.is_empty() { "none".to_string() } else { available.join(", ") }
                ),
                None => format!("no snapshots found under {}", self.site.root.display()),
            })
        })
    }

    fn verify(&self, fs: &dyn SiteFs, snapshot: &Path) -> Result<()> {
        let Some(manifest) = self.read_manifest(snapshot)? else {
            warn!("No manifest for {}, restoring unverified", snapshot.display());
            return Ok(());
        };
        if manifest.status != SnapshotStatus::Completed {
            return Err(MigrateError::Import(format!(
                "database snapshot {} was never completed",
                snapshot.display()
            )));
        }
        if let Some(expected) = manifest.digest {
            let actual = fs.digest(snapshot)?;
            if actual != expected {
                return Err(MigrateError::Import(format!(
                    "database snapshot {} is corrupted (digest {} != {})",
                    snapshot.display(),
                    actual,
                    expected
                )));
            }
            debug!("Snapshot digest verified: {}", actual);
        }
        Ok(())
    }

    /// Restore content first, then the database. A side with no snapshot is
    /// skipped.
    pub fn restore(&self, database: Option<&Path>, content: Option<&Path>) -> Result<()> {
        let fs = self.site.fs();
        let live = self.site.content_dir();

        match content {
            Some(aside) if fs.is_dir(aside)? => {
                fs.remove_all(&live)?;
                fs.rename(aside, &live)?;
                info!("Content directory restored from {}", aside.display());
            }
            Some(aside) => warn!(
                "Content snapshot {} is missing; content left as is",
                aside.display()
            ),
            None => info!("No content snapshot for this run; content left as is"),
        }

        match database {
            Some(snapshot) if fs.exists(snapshot)? => {
                self.verify(fs.as_ref(), snapshot)?;
                self.import_snapshot(fs.as_ref(), snapshot)?;
                info!("Database restored from {}", snapshot.display());
            }
            Some(snapshot) => warn!(
                "Database snapshot {} is missing; database left as is",
                snapshot.display()
            ),
            None => info!("No database snapshot for this run; database left as is"),
        }
        Ok(())
    }

    fn import_snapshot(&self, fs: &dyn SiteFs, snapshot: &Path) -> Result<()> {
        let wp = Wp::new(self.site);
        let is_gz = snapshot.extension().is_some_and(|e| e == "gz");
        if !is_gz {
            wp.db_reset()?;
            return wp.db_import(snapshot);
        }

        let plain = snapshot.with_extension("restore");
        fs.gunzip(snapshot, &plain)?;
        let result = wp.db_reset().and_then(|_| wp.db_import(&plain));
        if let Err(e) = fs.remove_all(&plain) {
            warn!("Failed to remove {}: {}", plain.display(), e);
        }
        result
    }

    fn restore_config(&self, copy: &Path) -> Result<()> {
        let fs = self.site.fs();
        if !fs.exists(copy)? {
            warn!("Config snapshot {} is missing; {} left as is", copy.display(), CONFIG_FILE);
            return Ok(());
        }
        fs.write(&self.site.root.join(CONFIG_FILE), &fs.read(copy)?)?;
        info!("{} restored from {}", CONFIG_FILE, copy.display());
        Ok(())
    }

    /// Restore every part of `set` that is present.
    pub fn restore_set(&self, set: &SnapshotSet) -> Result<()> {
        info!("Restoring snapshot {}", set.stamp);
        self.restore(set.database.as_deref(), set.content.as_deref())?;
        if let Some(copy) = &set.config {
            self.restore_config(copy)?;
        }
        Ok(())
    }
}
