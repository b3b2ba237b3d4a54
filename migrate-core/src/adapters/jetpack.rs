use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::{missing_dump, FormatAdapter, Inspection, Validation};
use crate::error::Result;
use crate::sniff::ContainerKind;
use crate::sql_consolidator::SqlConsolidator;

const META_FILE: &str = "meta.json";
const SQL_DIR: &str = "sql";
const MIN_TABLE_FILES: usize = 5;
const CONSOLIDATED_NAME: &str = "jetpack-consolidated.sql";

/// Jetpack Backup downloads: `meta.json`, one dump per table under `sql/`,
/// and the site files beside them.
#[derive(Debug, Default)]
pub struct Jetpack;

impl FormatAdapter for Jetpack {
    fn id(&self) -> &'static str {
        "jetpack"
    }

    fn display_name(&self) -> &'static str {
        "Jetpack Backup"
    }

    fn validate(&self, inspection: &Inspection) -> Validation {
        let table_files = inspection
            .children_of(SQL_DIR)
            .filter(|n| n.ends_with(".sql"))
            .count();

        let mut validation = Validation::default();
        validation
            .check(
                inspection.kind != ContainerKind::Unknown,
                "container type is not recognised",
            )
            .check(inspection.has_file_named(META_FILE), "no meta.json")
            .check(
                table_files >= MIN_TABLE_FILES,
                format!(
                    "found {} per-table dumps under sql/, expected at least {}",
                    table_files, MIN_TABLE_FILES
                ),
            );
        validation
    }

    fn locate_database(&self, extracted: &Path, work_dir: &Path) -> Result<PathBuf> {
        let sql_dir = WalkDir::new(extracted)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir() && e.file_name() == SQL_DIR)
            .min_by_key(|e| e.depth())
            .map(|e| e.into_path())
            .ok_or_else(|| missing_dump(self.display_name(), extracted))?;

        let output = work_dir.join(CONSOLIDATED_NAME);
        SqlConsolidator::new(MIN_TABLE_FILES).consolidate(&sql_dir, &output)?;
        Ok(output)
    }
}
