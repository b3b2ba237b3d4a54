use log::info;
use std::fmt;
use std::path::PathBuf;

use crate::config::Mode;
use crate::ledger::SnapshotSet;
use crate::url_alignment::UrlAlignment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    Verify,
    Confirm,
    MaintenanceOn,
    Backup,
    ApplyDb,
    Reconcile,
    ApplyContent,
    MaintenanceOff,
    Done,
    RolledBack,
    Aborted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::RolledBack | Phase::Aborted)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Verify => "verify",
            Phase::Confirm => "confirm",
            Phase::MaintenanceOn => "maintenance on",
            Phase::Backup => "backup",
            Phase::ApplyDb => "apply database",
            Phase::Reconcile => "reconcile",
            Phase::ApplyContent => "apply content",
            Phase::MaintenanceOff => "maintenance off",
            Phase::Done => "done",
            Phase::RolledBack => "rolled back",
            Phase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// State of one invocation. Owned by the orchestrator and shared with the
/// cleanup guard.
#[derive(Debug)]
pub struct MigrationRun {
    pub mode: Mode,
    pub dry_run: bool,
    pub stamp: String,
    pub phase: Phase,
    pub alignment: UrlAlignment,
    pub adapter: Option<&'static str>,
    pub snapshots: SnapshotSet,
    /// Set once every snapshot of the Backup phase has been written.
    pub backup_complete: bool,
    pub maintenance_source: bool,
    pub maintenance_dest: bool,
    pub work_dir: Option<PathBuf>,
}

impl MigrationRun {
    pub fn new(mode: Mode, dry_run: bool, stamp: String) -> Self {
        Self {
            mode,
            dry_run,
            snapshots: SnapshotSet {
                stamp: stamp.clone(),
                ..SnapshotSet::default()
            },
            stamp,
            phase: Phase::Init,
            alignment: UrlAlignment::new(),
            adapter: None,
            backup_complete: false,
            maintenance_source: false,
            maintenance_dest: false,
            work_dir: None,
        }
    }

    /// Move forward. Transitions never go back to an earlier phase.
    pub fn enter(&mut self, phase: Phase) {
        debug_assert!(phase >= self.phase, "phase {} after {}", phase, self.phase);
        if phase != self.phase {
            info!("--- Phase: {} ---", phase);
        }
        self.phase = phase;
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshots.database.is_some() || self.snapshots.content.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_and_snapshot_tracking() {
        let mut run = MigrationRun::new(
            Mode::BackupOnly { site: ".".into() },
            false,
            "20240101-000000".to_string(),
        );
        assert!(!run.has_snapshot());
        run.enter(Phase::Verify);
        run.enter(Phase::Backup);
        run.snapshots.database = Some("db-backups/20240101-000000.sql.gz".into());
        assert!(run.has_snapshot());
        assert!(!run.is_finished());
        run.enter(Phase::Done);
        assert!(run.is_finished());
        assert!(Phase::ApplyDb < Phase::ApplyContent);
    }
}
