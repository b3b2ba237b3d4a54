use std::fmt;
use std::io;
use std::path::PathBuf;

/// Why a single archive entry (or extracted file) was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsafeReason {
    AbsolutePath,
    ParentTraversal,
    SymlinkEscape { resolved: PathBuf },
    OutsideRoot { resolved: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsafeEntry {
    pub path: PathBuf,
    pub reason: UnsafeReason,
}

impl fmt::Display for UnsafeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            UnsafeReason::AbsolutePath => write!(f, "{}: absolute path", self.path.display()),
            UnsafeReason::ParentTraversal => {
                write!(f, "{}: contains a '..' segment", self.path.display())
            }
            UnsafeReason::SymlinkEscape { resolved } => write!(
                f,
                "{}: symlink resolves outside the extraction root ({})",
                self.path.display(),
                resolved.display()
            ),
            UnsafeReason::OutsideRoot { resolved } => write!(
                f,
                "{}: real path {} is outside the extraction root",
                self.path.display(),
                resolved.display()
            ),
        }
    }
}

/// Every failed check of one adapter, collected for the aggregate diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterFailure {
    pub adapter: &'static str,
    pub reasons: Vec<String>,
}

impl fmt::Display for AdapterFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.adapter, self.reasons.join("; "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("invalid arguments: {0}")]
    UserInput(String),

    #[error("preflight check failed: {0}")]
    Preflight(String),

    #[error("no known backup format matched the archive:\n{}", format_failures(.failures))]
    FormatDetection { failures: Vec<AdapterFailure> },

    #[error("archive failed path safety validation:\n{}", format_entries(.entries))]
    SecurityValidation { entries: Vec<UnsafeEntry> },

    #[error("reconciliation failed: {0}")]
    Reconciliation(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("import failed: {0}")]
    Import(String),

    #[error("'{command}' exited with status {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("interrupted during {phase}")]
    Interrupted { phase: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MigrateError {
    pub fn exit_code(&self) -> i32 {
        match self {
            MigrateError::UserInput(_) => 2,
            MigrateError::Preflight(_) => 3,
            MigrateError::FormatDetection { .. } => 4,
            MigrateError::SecurityValidation { .. } => 5,
            MigrateError::Reconciliation(_) => 6,
            MigrateError::Interrupted { .. } => 130,
            MigrateError::Transfer(_)
            | MigrateError::Import(_)
            | MigrateError::Command { .. }
            | MigrateError::Io(_)
            | MigrateError::Other(_) => 1,
        }
    }

    /// Failures that happen before anything destructive has been attempted.
    pub fn is_pre_destructive(&self) -> bool {
        matches!(
            self,
            MigrateError::UserInput(_)
                | MigrateError::Preflight(_)
                | MigrateError::FormatDetection { .. }
                | MigrateError::SecurityValidation { .. }
        )
    }
}

fn format_failures(failures: &[AdapterFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("  - {f}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_entries(entries: &[UnsafeEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, MigrateError>;
