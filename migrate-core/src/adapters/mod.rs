//! Backup-tool layouts.
//!
//! Each adapter recognises one third-party backup format from the archive's
//! table of contents, then knows where that format keeps its database dump and
//! content tree once unpacked. Adapters never unpack during validation, so the
//! registry can probe them speculatively.

use log::{info, warn};
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::archive::{Archive, ProgressObserver};
use crate::content_locator::{self, ContentCapabilities, CONTENT_DIR_NAME};
use crate::error::{MigrateError, Result};
use crate::sniff::ContainerKind;

mod backwpup;
mod duplicator;
mod jetpack;
mod solid_backups;

pub use backwpup::BackWpup;
pub use duplicator::Duplicator;
pub use jetpack::Jetpack;
pub use solid_backups::SolidBackups;

/// What validation looks at: the container kind and normalized entry names.
#[derive(Debug, Clone)]
pub struct Inspection {
    pub kind: ContainerKind,
    pub names: Vec<String>,
}

impl Inspection {
    /// An unrecognised container has no listing; every adapter then rejects
    /// it on the container check.
    pub fn of(archive: &Archive) -> Result<Self> {
        let names = match archive.kind {
            ContainerKind::Unknown => Vec::new(),
            _ => archive.entry_names()?,
        };
        Ok(Self {
            kind: archive.kind,
            names,
        })
    }

    pub fn has_file_named(&self, file_name: &str) -> bool {
        self.names.iter().any(|n| base_name(n) == file_name)
    }

    /// Names whose parent directory is called `dir_name`.
    pub fn children_of<'a>(&'a self, dir_name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.names
            .iter()
            .map(String::as_str)
            .filter(move |n| parent_name(n) == Some(dir_name))
    }

    /// Names living in the same directory as the first entry called `file_name`.
    pub fn siblings_of(&self, file_name: &str) -> Vec<&str> {
        let Some(anchor) = self.names.iter().find(|n| base_name(n) == file_name) else {
            return Vec::new();
        };
        let dir = parent_path(anchor);
        self.names
            .iter()
            .map(String::as_str)
            .filter(|n| parent_path(n) == dir && *n != anchor.as_str())
            .collect()
    }
}

pub(crate) fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn parent_path(name: &str) -> &str {
    name.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn parent_name(name: &str) -> Option<&str> {
    name.rsplit_once('/').map(|(dir, _)| base_name(dir))
}

/// Outcome of one adapter's validation: every failed check, not just the first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validation {
    pub failures: Vec<String>,
}

impl Validation {
    pub fn check(&mut self, ok: bool, failure: impl Into<String>) -> &mut Self {
        if !ok {
            self.failures.push(failure.into());
        }
        self
    }

    pub fn is_valid(&self) -> bool {
        self.failures.is_empty()
    }
}

pub trait FormatAdapter: Send + Sync {
    /// Stable identifier used by `--archive-format`.
    fn id(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    fn validate(&self, inspection: &Inspection) -> Validation;

    /// Unpack through both path-safety passes.
    fn extract(
        &self,
        archive: &Archive,
        dest: &Path,
        progress: Option<ProgressObserver<'_>>,
    ) -> Result<PathBuf> {
        archive.extract(dest, progress)
    }

    /// Path of an importable dump. Synthesized files are written into `work_dir`.
    fn locate_database(&self, extracted: &Path, work_dir: &Path) -> Result<PathBuf>;

    /// Content directory relative to the extraction root, when the format fixes one.
    fn canonical_content(&self) -> &'static str {
        CONTENT_DIR_NAME
    }

    /// Whether backups may hold several sites side by side.
    fn site_grouped(&self) -> bool {
        false
    }

    fn locate_content(&self, extracted: &Path) -> Option<PathBuf> {
        let canonical = extracted.join(self.canonical_content());
        if canonical.is_dir() {
            return Some(canonical);
        }
        let generic = content_locator::locate_best(extracted);
        let confident = generic
            .as_deref()
            .is_some_and(|dir| content_locator::score(dir) > 0);
        if !confident && self.site_grouped() {
            if let Some(nested) = content_locator::locate_best_nested(extracted) {
                return Some(nested);
            }
        }
        generic
    }

    /// External tools this format needs at import time.
    fn dependencies(&self) -> &'static [&'static str] {
        &["wp", "mysql"]
    }
}

impl fmt::Debug for dyn FormatAdapter + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FormatAdapter").field(&self.id()).finish()
    }
}

/// Everything a run needs from an unpacked backup.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub work_dir: PathBuf,
    pub root: PathBuf,
    pub database: PathBuf,
    pub content: Option<PathBuf>,
    pub capabilities: ContentCapabilities,
}

/// Extract with `adapter` and locate database and content inside `work_dir`.
pub fn extract_with(
    adapter: &dyn FormatAdapter,
    archive: &Archive,
    work_dir: &Path,
    progress: Option<ProgressObserver<'_>>,
) -> Result<ExtractionResult> {
    let root = adapter.extract(archive, &work_dir.join("extracted"), progress)?;
    let database = adapter.locate_database(&root, work_dir)?;
    let content = adapter.locate_content(&root);
    let capabilities = content
        .as_deref()
        .map(ContentCapabilities::of)
        .unwrap_or_default();

    match &content {
        Some(dir) if capabilities.is_empty() => warn!(
            "Content directory {} has no plugins, themes or uploads",
            dir.display()
        ),
        Some(dir) => info!("{} content directory: {}", adapter.display_name(), dir.display()),
        None => warn!("No content directory found in {}", root.display()),
    }

    Ok(ExtractionResult {
        work_dir: work_dir.to_path_buf(),
        root,
        database,
        content,
        capabilities,
    })
}

/// Shallowest file under `root` matching `pred`, name-sorted for determinism.
pub(crate) fn find_file(root: &Path, pred: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && pred(e.path()))
        .min_by_key(|e| e.depth())
        .map(|e| e.into_path())
}

pub(crate) fn file_name_of(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

pub(crate) fn missing_dump(adapter: &str, root: &Path) -> MigrateError {
    MigrateError::Import(format!(
        "{} database dump not found under {}",
        adapter,
        root.display()
    ))
}

pub(crate) fn container_one_of(kind: ContainerKind, allowed: &[ContainerKind]) -> bool {
    allowed.contains(&kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspection(names: &[&str]) -> Inspection {
        Inspection {
            kind: ContainerKind::Zip,
            names: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_name_helpers() {
        assert_eq!(base_name("a/b/c.sql"), "c.sql");
        assert_eq!(base_name("c.sql"), "c.sql");
        assert_eq!(parent_name("a/sql/c.sql"), Some("sql"));
        assert_eq!(parent_name("c.sql"), None);
    }

    #[test]
    fn test_inspection_queries() {
        let i = inspection(&[
            "backup/sql/wp_posts.sql",
            "backup/sql/wp_users.sql",
            "backup/meta.json",
            "backup/db.sql",
        ]);
        assert!(i.has_file_named("meta.json"));
        assert_eq!(i.children_of("sql").count(), 2);
        assert_eq!(i.siblings_of("meta.json"), vec!["backup/db.sql"]);
    }

    #[test]
    fn test_validation_collects_all_failures() {
        let mut v = Validation::default();
        v.check(false, "first").check(true, "never").check(false, "second");
        assert_eq!(v.failures, vec!["first", "second"]);
        assert!(!v.is_valid());
    }
}
