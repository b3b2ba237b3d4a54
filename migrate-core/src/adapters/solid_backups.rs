use std::path::{Path, PathBuf};

use super::{container_one_of, file_name_of, find_file, missing_dump, FormatAdapter, Inspection, Validation};
use crate::error::Result;
use crate::sniff::ContainerKind;
use crate::sql_consolidator::SqlConsolidator;

const DAT_FILE: &str = "backupbuddy_dat.php";
const CONSOLIDATED_NAME: &str = "solid-backups-consolidated.sql";

/// Solid Backups (formerly BackupBuddy) zips: the dump set sits beside
/// `backupbuddy_dat.php` in a temp directory inside the uploads tree.
#[derive(Debug, Default)]
pub struct SolidBackups;

impl FormatAdapter for SolidBackups {
    fn id(&self) -> &'static str {
        "solid-backups"
    }

    fn display_name(&self) -> &'static str {
        "Solid Backups"
    }

    fn validate(&self, inspection: &Inspection) -> Validation {
        let sql_beside_dat = inspection
            .siblings_of(DAT_FILE)
            .iter()
            .any(|n| n.ends_with(".sql"));

        let mut validation = Validation::default();
        validation
            .check(
                container_one_of(
                    inspection.kind,
                    &[ContainerKind::Zip, ContainerKind::Directory],
                ),
                format!("container is {}, Solid Backups archives are zip", inspection.kind),
            )
            .check(inspection.has_file_named(DAT_FILE), "no backupbuddy_dat.php")
            .check(sql_beside_dat, "no .sql dump beside backupbuddy_dat.php");
        validation
    }

    fn locate_database(&self, extracted: &Path, work_dir: &Path) -> Result<PathBuf> {
        let dat = find_file(extracted, |p| file_name_of(p) == DAT_FILE)
            .ok_or_else(|| missing_dump(self.display_name(), extracted))?;
        let dump_dir = dat
            .parent()
            .ok_or_else(|| missing_dump(self.display_name(), extracted))?;

        let output = work_dir.join(CONSOLIDATED_NAME);
        SqlConsolidator::new(1).consolidate(dump_dir, &output)?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::fixtures::write_tree;
    use std::fs;
    use tempfile::TempDir;

    const TEMP_DIR: &str = "wp-content/uploads/backupbuddy_temp/k2j3h4";

    #[test]
    fn test_validate() {
        let inspection = Inspection {
            kind: ContainerKind::Zip,
            names: vec![
                format!("{TEMP_DIR}/backupbuddy_dat.php"),
                format!("{TEMP_DIR}/wp_options.sql"),
                "importbuddy.php".into(),
            ],
        };
        assert!(SolidBackups.validate(&inspection).is_valid());

        let tar = Inspection {
            kind: ContainerKind::Tar,
            names: vec!["wp_options.sql".into()],
        };
        assert_eq!(SolidBackups.validate(&tar).failures.len(), 3);
    }

    #[test]
    fn test_locate_database_merges_dump_set() {
        let temp_dir = TempDir::new().unwrap();
        let extracted = temp_dir.path().join("x");
        let dat = format!("{TEMP_DIR}/backupbuddy_dat.php");
        let posts = format!("{TEMP_DIR}/wp_posts.sql");
        let options = format!("{TEMP_DIR}/wp_options.sql");
        write_tree(
            &extracted,
            &[
                (dat.as_str(), "<?php"),
                (posts.as_str(), "posts"),
                (options.as_str(), "options"),
            ],
        );
        let dump = SolidBackups
            .locate_database(&extracted, temp_dir.path())
            .unwrap();
        assert_eq!(fs::read_to_string(dump).unwrap(), "options\n\nposts");
    }
}
