use log::info;
use std::path::{Path, PathBuf};

use super::{container_one_of, file_name_of, find_file, missing_dump, FormatAdapter, Inspection, Validation};
use crate::error::Result;
use crate::sniff::ContainerKind;

const INSTALLER_DIR: &str = "dup-installer";
const DUMP_PREFIX: &str = "dup-database__";

/// Duplicator packages: a zip holding the site root plus `dup-installer/`
/// with a single `dup-database__<hash>.sql` dump.
#[derive(Debug, Default)]
pub struct Duplicator;

fn is_dump_name(file_name: &str) -> bool {
    file_name.starts_with(DUMP_PREFIX) && file_name.ends_with(".sql")
}

impl FormatAdapter for Duplicator {
    fn id(&self) -> &'static str {
        "duplicator"
    }

    fn display_name(&self) -> &'static str {
        "Duplicator"
    }

    fn validate(&self, inspection: &Inspection) -> Validation {
        let mut validation = Validation::default();
        validation
            .check(
                container_one_of(
                    inspection.kind,
                    &[ContainerKind::Zip, ContainerKind::Directory],
                ),
                format!("container is {}, Duplicator packages are zip", inspection.kind),
            )
            .check(
                inspection
                    .names
                    .iter()
                    .any(|n| n.split('/').any(|seg| seg == INSTALLER_DIR)),
                "no dup-installer/ directory",
            )
            .check(
                inspection.children_of(INSTALLER_DIR).any(|n| is_dump_name(super::base_name(n))),
                "no dup-installer/dup-database__*.sql dump",
            );
        validation
    }

    fn locate_database(&self, extracted: &Path, _work_dir: &Path) -> Result<PathBuf> {
        let dump = find_file(extracted, |p| {
            is_dump_name(file_name_of(p))
                && p.parent().map(file_name_of) == Some(INSTALLER_DIR)
        })
        .ok_or_else(|| missing_dump(self.display_name(), extracted))?;
        info!("Duplicator dump: {}", dump.display());
        Ok(dump)
    }
}
