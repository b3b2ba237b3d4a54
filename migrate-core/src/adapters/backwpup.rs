use anyhow::Context;
use flate2::read::GzDecoder;
use log::info;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use super::{file_name_of, find_file, missing_dump, FormatAdapter, Inspection, Validation};
use crate::error::Result;
use crate::sniff::ContainerKind;

const README: &str = "backwpup_readme.txt";

/// BackWPup job archives: a readme marker with the database dump beside it,
/// possibly gzipped. Multi-site jobs nest one folder per site.
#[derive(Debug, Default)]
pub struct BackWpup;

fn is_dump_name(name: &str) -> bool {
    name.ends_with(".sql") || name.ends_with(".sql.gz")
}

impl FormatAdapter for BackWpup {
    fn id(&self) -> &'static str {
        "backwpup"
    }

    fn display_name(&self) -> &'static str {
        "BackWPup"
    }

    fn site_grouped(&self) -> bool {
        true
    }

    fn validate(&self, inspection: &Inspection) -> Validation {
        let dump_beside_readme = inspection
            .siblings_of(README)
            .iter()
            .any(|n| is_dump_name(n));

        let mut validation = Validation::default();
        validation
            .check(
                inspection.kind != ContainerKind::Unknown,
                "container type is not recognised",
            )
            .check(inspection.has_file_named(README), "no backwpup_readme.txt")
            .check(
                dump_beside_readme,
                "no .sql or .sql.gz dump beside backwpup_readme.txt",
            );
        validation
    }

    fn locate_database(&self, extracted: &Path, work_dir: &Path) -> Result<PathBuf> {
        let readme = find_file(extracted, |p| file_name_of(p) == README)
            .ok_or_else(|| missing_dump(self.display_name(), extracted))?;
        let dir = readme
            .parent()
            .ok_or_else(|| missing_dump(self.display_name(), extracted))?;

        let mut dumps: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_dump_name(file_name_of(p)))
            .collect();
        // Plain dumps sort ahead of their gzipped twins.
        dumps.sort();
        let dump = dumps
            .into_iter()
            .next()
            .ok_or_else(|| missing_dump(self.display_name(), extracted))?;

        if file_name_of(&dump).ends_with(".gz") {
            let stem = file_name_of(&dump).trim_end_matches(".gz").to_string();
            let output = work_dir.join(stem);
            let mut decoder = GzDecoder::new(File::open(&dump)?);
            let mut out = File::create(&output)
                .with_context(|| format!("Failed to create {}", output.display()))?;
            io::copy(&mut decoder, &mut out)
                .with_context(|| format!("Failed to decompress {}", dump.display()))?;
            info!("Decompressed {} to {}", dump.display(), output.display());
            return Ok(output);
        }
        Ok(dump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::fixtures::write_tree;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_validate() {
        let ok = Inspection {
            kind: ContainerKind::CompressedTar,
            names: vec![
                "backwpup_readme.txt".into(),
                "mysite.sql.gz".into(),
                "wp-content/themes".into(),
            ],
        };
        assert!(BackWpup.validate(&ok).is_valid());

        let no_dump = Inspection {
            kind: ContainerKind::Zip,
            names: vec!["backwpup_readme.txt".into(), "wp-content/db.sql".into()],
        };
        let v = BackWpup.validate(&no_dump);
        assert_eq!(v.failures.len(), 1);
    }

    #[test]
    fn test_gzipped_dump_is_decompressed_into_work_dir() {
        let temp_dir = TempDir::new().unwrap();
        let extracted = temp_dir.path().join("x");
        write_tree(&extracted, &[("backwpup_readme.txt", "readme")]);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"CREATE TABLE wp_posts;").unwrap();
        fs::write(extracted.join("site.sql.gz"), encoder.finish().unwrap()).unwrap();

        let work_dir = temp_dir.path().join("work");
        fs::create_dir_all(&work_dir).unwrap();
        let dump = BackWpup.locate_database(&extracted, &work_dir).unwrap();
        assert_eq!(dump, work_dir.join("site.sql"));
        assert_eq!(fs::read_to_string(dump).unwrap(), "CREATE TABLE wp_posts;");
    }

    #[test]
    fn test_site_grouped_content_lookup() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write_tree(
            root,
            &[
                ("backwpup_readme.txt", ""),
                ("sites/blog/plugins/", ""),
                ("sites/blog/themes/", ""),
                ("sites/blog/uploads/", ""),
            ],
        );
        let content = BackWpup.locate_content(root).unwrap();
        assert_eq!(content, root.join("sites/blog"));
    }

    #[test]
    fn test_named_content_dir_wins_over_grouping() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write_tree(
            root,
            &[("files/wp-content/uploads/", ""), ("sites/blog/themes/", "")],
        );
        let content = BackWpup.locate_content(root).unwrap();
        assert_eq!(content, root.join("files/wp-content"));
    }
}
