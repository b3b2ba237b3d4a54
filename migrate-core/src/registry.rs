use log::{debug, info};

use crate::adapters::{BackWpup, Duplicator, FormatAdapter, Inspection, Jetpack, SolidBackups};
use crate::archive::Archive;
use crate::error::{AdapterFailure, MigrateError, Result};
use crate::preflight;

/// Ordered set of known backup layouts. Detection is first-match-wins.
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn FormatAdapter>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new(vec![
            Box::new(Duplicator),
            Box::new(Jetpack),
            Box::new(SolidBackups),
            Box::new(BackWpup),
        ])
    }
}

impl AdapterRegistry {
    pub fn new(adapters: Vec<Box<dyn FormatAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.id()).collect()
    }

    pub fn by_id(&self, id: &str) -> Result<&dyn FormatAdapter> {
        self.adapters
            .iter()
            .find(|a| a.id() == id)
            .map(|a| a.as_ref())
            .ok_or_else(|| {
                MigrateError::UserInput(format!(
                    "unknown archive format '{}', expected one of: {}",
                    id,
                    self.ids().join(", ")
                ))
            })
    }

    /// Validate against an already-built inspection. Pure: nothing is unpacked.
    pub fn detect_in(
        &self,
        inspection: &Inspection,
    ) -> std::result::Result<&dyn FormatAdapter, Vec<AdapterFailure>> {
        let mut failures = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            let validation = adapter.validate(inspection);
            if validation.is_valid() {
                info!("Detected backup format: {}", adapter.display_name());
                return Ok(adapter.as_ref());
            }
            debug!(
                "{} rejected the archive: {:?}",
                adapter.id(),
                validation.failures
            );
            failures.push(AdapterFailure {
                adapter: adapter.id(),
                reasons: validation.failures,
            });
        }
        Err(failures)
    }

    pub fn detect(&self, archive: &Archive) -> Result<&dyn FormatAdapter> {
        let inspection = Inspection::of(archive)?;
        self.detect_in(&inspection)
            .map_err(|failures| MigrateError::FormatDetection { failures })
    }

    /// Use `format_override` when given, otherwise detect.
    pub fn select(&self, archive: &Archive, format_override: Option<&str>) -> Result<&dyn FormatAdapter> {
        match format_override {
            Some(id) => {
                let adapter = self.by_id(id)?;
                info!("Using archive format override: {}", adapter.display_name());
                Ok(adapter)
            }
            None => self.detect(archive),
        }
    }

    /// Only the selected adapter's tools are checked.
    pub fn check_dependencies(adapter: &dyn FormatAdapter) -> Result<()> {
        preflight::require_tools(adapter.dependencies()).map_err(|e| match e {
            MigrateError::Preflight(msg) => {
                MigrateError::Preflight(format!("{} import: {}", adapter.display_name(), msg))
            }
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sniff::ContainerKind;

    fn inspection(kind: ContainerKind, names: &[&str]) -> Inspection {
        Inspection {
            kind,
            names: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_detects_each_known_layout() {
        let registry = AdapterRegistry::default();
        let cases = vec![
            (
                inspection(
                    ContainerKind::Zip,
                    &["dup-installer/dup-database__1.sql", "wp-content/themes"],
                ),
                "duplicator",
            ),
            (
                inspection(
                    ContainerKind::CompressedTar,
                    &[
                        "meta.json",
                        "sql/wp_a.sql",
                        "sql/wp_b.sql",
                        "sql/wp_c.sql",
                        "sql/wp_d.sql",
                        "sql/wp_e.sql",
                    ],
                ),
                "jetpack",
            ),
            (
                inspection(
                    ContainerKind::Zip,
                    &["tmp/backupbuddy_dat.php", "tmp/wp_options.sql"],
                ),
                "solid-backups",
            ),
            (
                inspection(
                    ContainerKind::Tar,
                    &["backwpup_readme.txt", "site.sql"],
                ),
                "backwpup",
            ),
        ];

        for (inspection, expected) in cases {
            let adapter = registry.detect_in(&inspection).unwrap();
            assert_eq!(adapter.id(), expected);
        }
    }

    #[test]
    fn test_garbage_lists_every_adapter() {
        let registry = AdapterRegistry::default();
        let failures = registry
            .detect_in(&inspection(ContainerKind::Zip, &["random.txt"]))
            .unwrap_err();
        let ids: Vec<&str> = failures.iter().map(|f| f.adapter).collect();
        assert_eq!(ids, registry.ids());
        assert!(failures.iter().all(|f| !f.reasons.is_empty()));
    }

    #[test]
    fn test_unknown_override_is_user_error() {
        let registry = AdapterRegistry::default();
        let err = registry.by_id("tarsnap").err().unwrap();
        assert!(matches!(err, MigrateError::UserInput(_)));
        assert!(err.to_string().contains("duplicator, jetpack, solid-backups, backwpup"));
    }

    #[test]
    fn test_adapter_debug_names_the_format() {
        let registry = AdapterRegistry::default();
        let adapter = registry.by_id("jetpack").unwrap();
        assert_eq!(format!("{adapter:?}"), "FormatAdapter(\"jetpack\")");
    }
}
