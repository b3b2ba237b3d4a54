use log::{debug, info, warn};
use std::collections::HashSet;
use std::path::Path;

use crate::error::Result;
use crate::site::Site;
use crate::wp::Wp;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub plugins: Vec<String>,
    pub themes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryDiff {
    pub missing_plugins: Vec<String>,
    pub missing_themes: Vec<String>,
}

impl InventoryDiff {
    pub fn is_empty(&self) -> bool {
        self.missing_plugins.is_empty() && self.missing_themes.is_empty()
    }
}

/// Items of `before` absent from `after`, in `before` order.
pub fn missing(before: &[String], after: &[String]) -> Vec<String> {
    let after: HashSet<&str> = after.iter().map(String::as_str).collect();
    before
        .iter()
        .filter(|item| !after.contains(item.as_str()))
        .cloned()
        .collect()
}

impl Inventory {
    pub fn capture(site: &Site) -> Result<Self> {
        let wp = Wp::new(site);
        Ok(Self {
            plugins: wp.active_plugins()?,
            themes: wp.themes()?,
        })
    }

    pub fn diff(&self, after: &Inventory) -> InventoryDiff {
        InventoryDiff {
            missing_plugins: missing(&self.plugins, &after.plugins),
            missing_themes: missing(&self.themes, &after.themes),
        }
    }
}

pub fn log_diff(diff: &InventoryDiff) {
    if diff.is_empty() {
        info!("All previously active plugins and installed themes are still present");
        return;
    }
    if !diff.missing_plugins.is_empty() {
        warn!("Plugins active before the import but gone now: {}", diff.missing_plugins.join(", "));
    }
    if !diff.missing_themes.is_empty() {
        warn!("Themes present before the import but gone now: {}", diff.missing_themes.join(", "));
    }
}

/// Copy each named plugin directory from the moved-aside content tree back
/// into the live one. Failures are logged and skipped. Returns how many were
/// copied.
pub fn preserve_plugins(site: &Site, aside: &Path, plugins: &[String]) -> usize {
    let fs = site.fs();
    let live = site.content_dir().join("plugins");
    let mut copied = 0;
    for plugin in plugins {
        let from = aside.join("plugins").join(plugin);
        let to = live.join(plugin);
        let outcome = (|| -> Result<Option<bool>> {
            if fs.exists(&to)? {
                return Ok(None);
            }
            if !fs.is_dir(&from)? {
                return Ok(Some(false));
            }
            fs.create_dir_all(&live)?;
            fs.copy_recursive(&from, &to)?;
            Ok(Some(true))
        })();
        match outcome {
            Ok(Some(true)) => {
                info!("Preserved destination plugin {}", plugin);
                copied += 1;
            }
            Ok(Some(false)) => warn!("Plugin {} not found in {}; not preserved", plugin, aside.display()),
            Ok(None) => debug!("Plugin {} already present after import", plugin),
            Err(e) => warn!("Failed to preserve plugin {}: {}", plugin, e),
        }
    }
    copied
}
