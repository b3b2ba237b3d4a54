//! Phase sequencing for every run mode.
//!
//! A run moves strictly forward through [`Phase`]. Once the Backup phase has
//! written a snapshot, any failure other than an interrupt restores it before
//! the error is returned. Interrupts are left to the [`CleanupGuard`], which
//! restores only when the run stopped inside the database-replace window.

use anyhow::Context;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::Path;
use tempfile::TempDir;

use crate::adapters;
use crate::archive::{Archive, ProgressObserver};
use crate::command::{SshRunner, Transfer, Transport, PROTECTED_DROP_INS};
use crate::config::{Mode, Settings};
use crate::error::{MigrateError, Result};
use crate::guard::{CleanupGuard, InterruptLatch};
use crate::inventory::{self, Inventory};
use crate::ledger::{self, BackupLedger};
use crate::preflight;
use crate::registry::AdapterRegistry;
use crate::run::{MigrationRun, Phase};
use crate::site::{Side, Site};
use crate::table_prefix::{self, CORE_TABLES};
use crate::url_alignment::UrlAlignment;
use crate::wp::Wp;

/// Extraction progress is logged every this many entries.
pub const PROGRESS_EVERY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    DryRun,
    Declined,
    RolledBack,
}

pub trait Confirm {
    fn confirm(&self, summary: &str) -> Result<bool>;
}

/// Asks on stderr and reads the answer from stdin.
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, summary: &str) -> Result<bool> {
        let mut stderr = io::stderr();
        writeln!(stderr, "{summary}")?;
        write!(stderr, "Proceed? [y/N] ")?;
        stderr.flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    }
}

pub fn stdin_is_interactive() -> bool {
    io::stdin().is_terminal()
}

pub struct Orchestrator<'s> {
    settings: &'s Settings,
    registry: AdapterRegistry,
    latch: InterruptLatch,
    confirm: Box<dyn Confirm + 's>,
    check_tools: bool,
}

/// Restore a destination's own drop-ins from its moved-aside content tree.
fn carry_drop_ins(site: &Site, aside: &Path) {
    let fs = site.fs();
    let live = site.content_dir();
    for name in PROTECTED_DROP_INS {
        let result = (|| -> Result<()> {
            fs.remove_all(&live.join(name))?;
            let kept = aside.join(name);
            if fs.exists(&kept)? {
                fs.copy_recursive(&kept, &live.join(name))?;
                debug!("Kept destination drop-in {}", name);
            }
            Ok(())
        })();
        if let Err(e) = result {
            warn!("Failed to carry over drop-in {}: {}", name, e);
        }
    }
}

fn extraction_progress(done: usize, total: usize) {
    if done % PROGRESS_EVERY == 0 || done == total {
        info!("Extracted {}/{} entries", done, total);
    }
}

fn work_dir() -> Result<TempDir> {
    Ok(tempfile::Builder::new()
        .prefix("wp-migrate-")
        .tempdir()
        .with_context(|| "Failed to create work directory")?)
}

/// Remove the work directory on success, keep it for diagnosis otherwise.
fn settle_work_dir<T>(result: &Result<T>, work: Option<TempDir>) {
    let Some(dir) = work else {
        return;
    };
    if result.is_ok() {
        let path = dir.path().to_path_buf();
        if let Err(e) = dir.close() {
            warn!("Failed to remove work directory {}: {}", path.display(), e);
        }
    } else {
        let kept = dir.keep();
        warn!("Work directory kept for inspection: {}", kept.display());
    }
}

impl<'s> Orchestrator<'s> {
    pub fn new(settings: &'s Settings, latch: InterruptLatch) -> Self {
        Self {
            settings,
            registry: AdapterRegistry::default(),
            latch,
            confirm: Box::new(StdinConfirm),
            check_tools: true,
        }
    }

    pub fn with_confirm(mut self, confirm: Box<dyn Confirm + 's>) -> Self {
        self.confirm = confirm;
        self
    }

    /// Skip PATH lookups of external tools, for runners that do not use them.
    pub fn without_tool_checks(mut self) -> Self {
        self.check_tools = false;
        self
    }

    fn new_run(&self) -> Mutex<MigrationRun> {
        Mutex::new(MigrationRun::new(
            self.settings.mode.clone(),
            self.settings.dry_run,
            ledger::stamp_now(),
        ))
    }

    fn enter(&self, run: &Mutex<MigrationRun>, phase: Phase) -> Result<()> {
        let current = run.lock().phase;
        self.latch.check(current)?;
        run.lock().enter(phase);
        Ok(())
    }

    fn finish(&self, run: &Mutex<MigrationRun>, phase: Phase, outcome: Outcome) -> Result<Outcome> {
        run.lock().enter(phase);
        Ok(outcome)
    }

    /// `Ok(true)` to proceed. Dry runs and `--yes` skip the question; without
    /// a terminal and without either, the run is refused.
    fn confirm(&self, run: &Mutex<MigrationRun>, summary: &str) -> Result<bool> {
        self.enter(run, Phase::Confirm)?;
        if self.settings.dry_run {
            info!("Dry run: no confirmation needed");
            return Ok(true);
        }
        if self.settings.assume_yes {
            info!("Confirmation skipped (--yes)");
            return Ok(true);
        }
        if !self.settings.interactive {
            return Err(MigrateError::UserInput(format!(
                "refusing to run {} unattended; pass --yes to confirm or --dry-run to preview",
                self.settings.mode.name()
            )));
        }
        self.confirm.confirm(summary)
    }

    fn declined(&self, run: &Mutex<MigrationRun>) -> Result<Outcome> {
        info!("Declined; nothing was changed");
        self.finish(run, Phase::Aborted, Outcome::Declined)
    }

    /// Turn a failed run into its final error, restoring this run's snapshots
    /// first when something destructive may have happened.
    fn settle<T>(&self, run: &Mutex<MigrationRun>, site: &Site, result: Result<T>) -> Result<T> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let mut run = run.lock();
        let err = match err {
            MigrateError::Interrupted { .. } => err,
            other if self.latch.is_set() => {
                debug!("Failure after interrupt: {}", other);
                MigrateError::Interrupted {
                    phase: run.phase.to_string(),
                }
            }
            other => other,
        };

        if matches!(err, MigrateError::Interrupted { .. }) {
            error!("Interrupted during {}", run.phase);
            return Err(err);
        }

        error!("{} failed during {}: {}", run.mode.name(), run.phase, err);
        if run.dry_run || !run.has_snapshot() {
            if !err.is_pre_destructive() && run.phase > Phase::Backup {
                error!("No snapshot was taken; the installation needs manual recovery");
            }
            run.enter(Phase::Aborted);
            return Err(err);
        }

        let mut set = run.snapshots.clone();
        if run.phase < Phase::ApplyDb {
            set.database = None;
            set.config = None;
        }
        warn!("Rolling back to snapshot {}", run.stamp);
        match BackupLedger::new(site).restore_set(&set) {
            Ok(()) => {
                info!("Rollback complete; the installation is back to its pre-run state");
                run.enter(Phase::RolledBack);
            }
            Err(rollback_err) => {
                error!(
                    "Rollback failed: {}. Restore manually with --rollback --rollback-backup {}",
                    rollback_err, run.stamp
                );
                run.enter(Phase::Aborted);
            }
        }
        Err(err)
    }

    fn engage_maintenance(&self, run: &Mutex<MigrationRun>, site: &Site) -> Result<()> {
        Wp::new(site).maintenance(true)?;
        let mut run = run.lock();
        match site.side {
            Side::Source => run.maintenance_source = true,
            Side::Destination => run.maintenance_dest = true,
        }
        Ok(())
    }

    fn release_maintenance(&self, run: &Mutex<MigrationRun>, site: &Site) -> Result<()> {
        Wp::new(site).maintenance(false)?;
        let mut run = run.lock();
        match site.side {
            Side::Source => run.maintenance_source = false,
            Side::Destination => run.maintenance_dest = false,
        }
        Ok(())
    }

    fn flush_cache(&self, site: &Site) {
        if let Err(e) = Wp::new(site).cache_flush() {
            warn!("Cache flush on {} failed: {}", site.describe(), e);
        }
    }

    /// Database snapshot plus content rename-aside on `site`.
    fn backup(&self, run: &Mutex<MigrationRun>, site: &Site, move_content: bool) -> Result<()> {
        self.enter(run, Phase::Backup)?;
        let ledger = BackupLedger::new(site).with_gzip(self.settings.gzip);
        let stamp = run.lock().stamp.clone();

        let database = ledger.snapshot_database(&stamp)?;
        run.lock().snapshots.database = Some(database);
        let config = ledger.snapshot_config(&stamp)?;
        run.lock().snapshots.config = config;
        if move_content {
            let aside = ledger.snapshot_content_tree(&stamp)?;
            run.lock().snapshots.content = aside;
        }
        run.lock().backup_complete = true;
        info!("Snapshot {} complete", stamp);
        Ok(())
    }

    /// Fix the table prefix, then rewrite every stored URL of the imported
    /// database to `targets` (option name and wanted value).
    fn reconcile(&self, run: &Mutex<MigrationRun>, site: &Site, targets: &[(&str, String)]) -> Result<()> {
        self.enter(run, Phase::Reconcile)?;
        let wp = Wp::new(site);

        let tables = wp.db_tables()?;
        let prefix = table_prefix::detect(&tables).ok_or_else(|| {
            MigrateError::Reconciliation(format!(
                "imported database has no complete {} table set",
                CORE_TABLES.join("/")
            ))
        })?;
        table_prefix::reconcile(site, &prefix)?;

        let mut alignment = UrlAlignment::new();
        for (option, target) in targets {
            let imported = wp.option_get(option)?;
            debug!("Imported {} is '{}', wanted '{}'", option, imported, target);
            alignment.add_alignment(&imported, target);
        }
        for pair in &self.settings.search_replace {
            alignment.push(pair.clone());
        }
        for pair in alignment.pairs() {
            wp.search_replace(&pair.old, &pair.new).map_err(|e| {
                MigrateError::Reconciliation(format!(
                    "search-replace '{}' -> '{}' failed: {}",
                    pair.old, pair.new, e
                ))
            })?;
        }
        info!("Applied {} search-replace pairs", alignment.len());
        run.lock().alignment = alignment;
        Ok(())
    }

    fn url_targets(&self, wp: &Wp<'_>) -> Result<Vec<(&'static str, String)>> {
        let mut targets = Vec::with_capacity(2);
        for option in ["home", "siteurl"] {
            let value = match &self.settings.dest_url {
                Some(url) => url.clone(),
                None => wp.option_get(option)?,
            };
            targets.push((option, value));
        }
        Ok(targets)
    }

    /// Restore a backup archive into the local installation at `site`.
    pub fn import_archive(&self, archive: &Path, format: Option<&str>, site: &Site) -> Result<Outcome> {
        info!("=== Archive import started: {} ===", archive.display());
        let run = self.new_run();
        let _guard = CleanupGuard::new(&run, site, None);
        let mut work = None;

        let result = self.import_archive_phases(&run, archive, format, site, &mut work);
        let result = self.settle(&run, site, result);
        settle_work_dir(&result, work);
        if let Ok(outcome) = &result {
            info!("=== Archive import finished: {:?} ===", outcome);
        }
        result
    }

    fn import_archive_phases(
        &self,
        run: &Mutex<MigrationRun>,
        archive_path: &Path,
        format: Option<&str>,
        site: &Site,
        work: &mut Option<TempDir>,
    ) -> Result<Outcome> {
        self.enter(run, Phase::Verify)?;
        let archive = Archive::open(archive_path)?;
        let adapter = self.registry.select(&archive, format)?;
        run.lock().adapter = Some(adapter.id());
        if self.check_tools {
            AdapterRegistry::check_dependencies(adapter)?;
        }
        preflight::check_installation(site)?;
        let wp = Wp::new(site);

        let dir = work.insert(work_dir()?);
        preflight::check_extraction_space(archive.size, dir.path())?;
        run.lock().work_dir = Some(dir.path().to_path_buf());
        let progress: ProgressObserver<'_> = &extraction_progress;
        let extraction = adapters::extract_with(adapter, &archive, dir.path(), Some(progress))?;

        preflight::check_snapshot_space(site, wp.db_size()?)?;
        let targets = self.url_targets(&wp)?;
        let before = Inventory::capture(site)?;
        let replace_content = extraction.content.is_some();

        let summary = format!(
            "Restore {} backup {} into {}.\n  database: {}\n  content: {}\nThe current database and content will be snapshotted first.",
            adapter.display_name(),
            archive.path.display(),
            site.describe(),
            extraction.database.display(),
            extraction
                .content
                .as_deref()
                .map(|c| c.display().to_string())
                .unwrap_or_else(|| "none (existing content kept)".to_string()),
        );
        if !self.confirm(run, &summary)? {
            return self.declined(run);
        }
        if self.settings.dry_run {
            info!("Dry run plan:\n{}", summary);
            for (option, target) in &targets {
                info!("Imported {} would be aligned to {}", option, target);
            }
            return self.finish(run, Phase::Done, Outcome::DryRun);
        }

        self.enter(run, Phase::MaintenanceOn)?;
        self.engage_maintenance(run, site)?;

        self.backup(run, site, replace_content)?;

        self.enter(run, Phase::ApplyDb)?;
        wp.db_reset()?;
        wp.db_import(&extraction.database)
            .map_err(|e| MigrateError::Import(format!("database import failed: {e}")))?;
        info!("Imported {}", extraction.database.display());

        self.reconcile(run, site, &targets)?;

        self.enter(run, Phase::ApplyContent)?;
        match &extraction.content {
            Some(content) => {
                site.fs().copy_recursive(content, &site.content_dir())?;
                let aside = run.lock().snapshots.content.clone();
                if let Some(aside) = &aside {
                    carry_drop_ins(site, aside);
                }
                info!("Content restored from {}", content.display());

                match Inventory::capture(site) {
                    Ok(after) => {
                        let diff = before.diff(&after);
                        inventory::log_diff(&diff);
                        if self.settings.preserve_dest_plugins {
                            match &aside {
                                Some(aside) => {
                                    inventory::preserve_plugins(site, aside, &diff.missing_plugins);
                                }
                                None => warn!("No content snapshot to preserve plugins from"),
                            }
                        }
                    }
                    Err(e) => warn!("Could not list plugins after import: {}", e),
                }
            }
            None => warn!("Archive has no content directory; existing content kept"),
        }

        self.enter(run, Phase::MaintenanceOff)?;
        self.release_maintenance(run, site)?;
        self.flush_cache(site);
        self.finish(run, Phase::Done, Outcome::Completed)
    }

    /// Copy the local `source` installation onto `dest`.
    pub fn push(&self, source: &Site, dest: &Site, transport: &dyn Transfer) -> Result<Outcome> {
        info!("=== Push started: {} -> {} ===", source.describe(), dest.describe());
        let run = self.new_run();
        let _guard = CleanupGuard::new(&run, dest, Some(source));
        let mut work = None;

        let result = self.push_phases(&run, source, dest, transport, &mut work);
        let result = self.settle(&run, dest, result);
        settle_work_dir(&result, work);
        if let Ok(outcome) = &result {
            info!("=== Push finished: {:?} ===", outcome);
        }
        result
    }

    fn push_phases(
        &self,
        run: &Mutex<MigrationRun>,
        source: &Site,
        dest: &Site,
        transport: &dyn Transfer,
        work: &mut Option<TempDir>,
    ) -> Result<Outcome> {
        self.enter(run, Phase::Verify)?;
        if self.check_tools {
            let mut tools = vec!["rsync"];
            if dest.is_remote() {
                tools.push("ssh");
            }
            preflight::require_tools(&tools)?;
        }
        preflight::check_installation(source)?;
        preflight::check_installation(dest)?;
        let source_wp = Wp::new(source);
        let dest_wp = Wp::new(dest);

        let dir = work.insert(work_dir()?);
        preflight::ensure_space(
            "source database export",
            preflight::local_free_bytes(dir.path()),
            source_wp.db_size()?,
        )?;
        preflight::check_snapshot_space(dest, dest_wp.db_size()?)?;
        let targets = self.url_targets(&dest_wp)?;

        let summary = format!(
            "Push {} onto {}.\n  The destination database and content will be replaced after a snapshot.",
            source.describe(),
            dest.describe()
        );
        if !self.confirm(run, &summary)? {
            return self.declined(run);
        }
        if self.settings.dry_run {
            info!("Dry run plan:\n{}", summary);
            transport.push(&source.content_dir(), &dest.content_dir(), &PROTECTED_DROP_INS, true)?;
            return self.finish(run, Phase::Done, Outcome::DryRun);
        }

        self.enter(run, Phase::MaintenanceOn)?;
        self.engage_maintenance(run, source)?;
        self.engage_maintenance(run, dest)?;

        self.backup(run, dest, true)?;

        self.enter(run, Phase::ApplyDb)?;
        let stamp = run.lock().stamp.clone();
        let export = dir.path().join(format!("source-{stamp}.sql"));
        source_wp.db_export(&export)?;
        let staged = BackupLedger::new(dest).staged_import(&stamp);
        transport.push(&export, &staged, &[], false)?;
        dest_wp.db_reset()?;
        let imported = dest_wp.db_import(&staged);
        if let Err(e) = dest.fs().remove_all(&staged) {
            warn!("Failed to remove staged dump {}: {}", staged.display(), e);
        }
        imported.map_err(|e| MigrateError::Import(format!("database import failed: {e}")))?;

        self.reconcile(run, dest, &targets)?;

        self.enter(run, Phase::ApplyContent)?;
        transport.push(&source.content_dir(), &dest.content_dir(), &PROTECTED_DROP_INS, true)?;
        let aside = run.lock().snapshots.content.clone();
        if let Some(aside) = &aside {
            carry_drop_ins(dest, aside);
        }

        self.enter(run, Phase::MaintenanceOff)?;
        self.release_maintenance(run, dest)?;
        self.release_maintenance(run, source)?;
        self.flush_cache(dest);
        self.finish(run, Phase::Done, Outcome::Completed)
    }

    /// Put a snapshot set back in place.
    pub fn rollback(&self, site: &Site, snapshot: Option<&str>) -> Result<Outcome> {
        info!("=== Rollback started on {} ===", site.describe());
        let run = self.new_run();
        let _guard = CleanupGuard::new(&run, site, None);

        let result = self.rollback_phases(&run, site, snapshot);
        if let Err(e) = &result {
            error!("Rollback failed: {}", e);
            run.lock().enter(Phase::Aborted);
        } else {
            info!("=== Rollback finished ===");
        }
        result
    }

    fn rollback_phases(&self, run: &Mutex<MigrationRun>, site: &Site, snapshot: Option<&str>) -> Result<Outcome> {
        self.enter(run, Phase::Verify)?;
        if !site.fs().is_dir(&site.root)? {
            return Err(MigrateError::Preflight(format!(
                "site path does not exist: {}",
                site.root.display()
            )));
        }
        let ledger = BackupLedger::new(site);
        let set = ledger.find(snapshot)?;
        let summary = format!(
            "Roll back {} to snapshot {}.\n  database: {}\n  content: {}",
            site.describe(),
            set.stamp,
            set.database
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string()),
            set.content
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string()),
        );

        if !self.confirm(run, &summary)? {
            return self.declined(run);
        }
        if self.settings.dry_run {
            info!("Dry run plan:\n{}", summary);
            return self.finish(run, Phase::Done, Outcome::DryRun);
        }

        self.enter(run, Phase::MaintenanceOn)?;
        if let Err(e) = self.engage_maintenance(run, site) {
            warn!("Could not enable maintenance mode before rollback: {}", e);
        }

        self.enter(run, Phase::ApplyDb)?;
        ledger.restore_set(&set)?;

        self.enter(run, Phase::MaintenanceOff)?;
        if run.lock().maintenance_dest {
            self.release_maintenance(run, site)?;
        }
        self.flush_cache(site);
        self.finish(run, Phase::RolledBack, Outcome::RolledBack)
    }

    /// Snapshot database and content without changing the installation.
    pub fn backup_only(&self, site: &Site) -> Result<Outcome> {
        info!("=== Backup started on {} ===", site.describe());
        let run = self.new_run();
        let _guard = CleanupGuard::new(&run, site, None);

        self.enter(&run, Phase::Verify)?;
        preflight::check_installation(site)?;
        let wp = Wp::new(site);
        preflight::check_snapshot_space(site, wp.db_size()?)?;
        if self.settings.dry_run {
            info!(
                "Dry run: would snapshot the database into {} and copy the content directory",
                BackupLedger::new(site).db_dir().display()
            );
            return self.finish(&run, Phase::Done, Outcome::DryRun);
        }

        self.enter(&run, Phase::Backup)?;
        let ledger = BackupLedger::new(site).with_gzip(self.settings.gzip);
        let stamp = run.lock().stamp.clone();
        let database = ledger.snapshot_database(&stamp)?;
        let config = ledger.snapshot_config(&stamp)?;
        let content = ledger.copy_content_tree(&stamp)?;
        {
            let mut run = run.lock();
            run.snapshots.database = Some(database);
            run.snapshots.config = config;
            run.snapshots.content = content;
        }
        info!("=== Backup {} finished ===", stamp);
        self.finish(&run, Phase::Done, Outcome::Completed)
    }
}

/// Build the sites for `settings.mode` and run it.
pub fn execute(settings: &Settings, latch: InterruptLatch) -> Result<Outcome> {
    let orchestrator = Orchestrator::new(settings, latch);
    let wp_bin = settings.wp_bin.clone();

    match &settings.mode {
        Mode::Push { source, host, dest } => {
            let control_dir = tempfile::Builder::new()
                .prefix("wp-migrate-ssh-")
                .tempdir()
                .with_context(|| "Failed to create ssh control directory")?;
            let ssh = SshRunner::new(host, settings.ssh_opts.clone(), control_dir.path());
            let transport = Transport::over_ssh(&ssh)
                .with_opts(settings.rsync_opts.clone())
                .with_dry_run(settings.dry_run);
            let source = Site::local(Side::Source, source.clone(), wp_bin.clone());
            let dest = Site::new(Side::Destination, dest.clone(), wp_bin, Box::new(ssh));
            orchestrator.push(&source, &dest, &transport)
        }
        Mode::ArchiveImport { archive, format, site } => {
            let site = Site::local(Side::Destination, site.clone(), wp_bin);
            orchestrator.import_archive(archive, format.as_deref(), &site)
        }
        Mode::Rollback { site, snapshot } => {
            let site = Site::local(Side::Destination, site.clone(), wp_bin);
            orchestrator.rollback(&site, snapshot.as_deref())
        }
        Mode::BackupOnly { site } => {
            let site = Site::local(Side::Destination, site.clone(), wp_bin);
            orchestrator.backup_only(&site)
        }
    }
}
