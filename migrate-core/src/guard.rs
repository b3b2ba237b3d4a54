//! Interrupt latch and the cleanup guard that runs on every exit path.

use log::{error, info, warn};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{MigrateError, Result};
use crate::ledger::BackupLedger;
use crate::run::{MigrationRun, Phase};
use crate::site::Site;
use crate::wp::Wp;

static PROCESS_INTERRUPTED: AtomicBool = AtomicBool::new(false);

static HANDLERS_INSTALLED: Lazy<()> = Lazy::new(|| {
    #[cfg(unix)]
    {
        extern "C" fn latch(_signal: libc::c_int) {
            PROCESS_INTERRUPTED.store(true, Ordering::SeqCst);
        }
        let handler = latch as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // SAFETY: the handler only stores to an atomic.
        unsafe {
            libc::signal(libc::SIGINT, handler);
            libc::signal(libc::SIGTERM, handler);
        }
    }
});

/// Cooperative cancellation flag, checked at phase boundaries.
#[derive(Clone, Copy)]
pub struct InterruptLatch {
    flag: &'static AtomicBool,
}

impl InterruptLatch {
    /// The latch fed by SIGINT and SIGTERM for this process.
    pub fn process() -> Self {
        Lazy::force(&HANDLERS_INSTALLED);
        Self {
            flag: &PROCESS_INTERRUPTED,
        }
    }

    /// A latch no signal reaches; set it with [`trigger`](Self::trigger).
    pub fn detached() -> Self {
        Self {
            flag: Box::leak(Box::new(AtomicBool::new(false))),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self, phase: Phase) -> Result<()> {
        if self.is_set() {
            Err(MigrateError::Interrupted {
                phase: phase.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Registered once per run. On drop it restores the database if the run
/// stopped inside the database-replace window, releases maintenance mode on
/// both sides, and closes remote sessions.
pub struct CleanupGuard<'a> {
    run: &'a Mutex<MigrationRun>,
    dest: &'a Site,
    source: Option<&'a Site>,
}

impl<'a> CleanupGuard<'a> {
    pub fn new(run: &'a Mutex<MigrationRun>, dest: &'a Site, source: Option<&'a Site>) -> Self {
        Self { run, dest, source }
    }

    fn emergency_restore(&self, run: &mut MigrationRun) {
        warn!(
            "Run stopped while replacing the database; restoring snapshot {}",
            run.stamp
        );
        let ledger = BackupLedger::new(self.dest);
        match ledger.restore_set(&run.snapshots) {
            Ok(()) => {
                info!("Emergency restore completed");
                run.phase = Phase::RolledBack;
            }
            Err(e) => error!(
                "Emergency restore failed: {}. Restore manually with --rollback --rollback-backup {}",
                e, run.stamp
            ),
        }
    }

    fn release_maintenance(site: &Site, engaged: &mut bool) {
        if !*engaged {
            return;
        }
        match Wp::new(site).maintenance(false) {
            Ok(()) => *engaged = false,
            Err(e) => error!(
                "Failed to disable maintenance mode on {}: {}",
                site.describe(),
                e
            ),
        }
    }
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        let mut run = self.run.lock();

        if run.phase == Phase::ApplyDb && run.backup_complete && !run.dry_run {
            self.emergency_restore(&mut run);
        } else if run.backup_complete && !run.is_finished() {
            warn!(
                "Run stopped during {}; restore with --rollback --rollback-backup {}",
                run.phase, run.stamp
            );
        }

        let mut dest_engaged = run.maintenance_dest;
        Self::release_maintenance(self.dest, &mut dest_engaged);
        run.maintenance_dest = dest_engaged;
        if let Some(source) = self.source {
            let mut source_engaged = run.maintenance_source;
            Self::release_maintenance(source, &mut source_engaged);
            run.maintenance_source = source_engaged;
        }

        self.dest.runner().teardown();
        if let Some(source) = self.source {
            source.runner().teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;

    #[test]
    fn test_detached_latch() {
        let latch = InterruptLatch::detached();
        assert!(latch.check(Phase::Backup).is_ok());
        latch.trigger();
        let err = latch.check(Phase::Reconcile).unwrap_err();
        assert_eq!(err.to_string(), "interrupted during reconcile");
        assert_eq!(err.exit_code(), 130);
        assert!(!InterruptLatch::detached().is_set());
    }

    #[test]
    fn test_guard_without_engagement_is_quiet() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let site = Site::local(
            crate::site::Side::Destination,
            temp_dir.path().to_path_buf(),
            "definitely-not-wp".to_string(),
        );
        let run = Mutex::new(MigrationRun::new(
            Mode::BackupOnly { site: temp_dir.path().to_path_buf() },
            false,
            "s".to_string(),
        ));
        drop(CleanupGuard::new(&run, &site, None));
        assert!(!run.lock().maintenance_dest);
    }
}
