use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

use crate::error::{MigrateError, Result};
use crate::site::Site;
use crate::wp::Wp;

/// Core tables that must all exist under one prefix.
pub const CORE_TABLES: [&str; 3] = ["options", "posts", "users"];

pub const CONFIG_FILE: &str = "wp-config.php";

static TABLE_PREFIX_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^(\s*\$table_prefix\s*=\s*)(['"])([^'"]*)(['"])(\s*;)"#)
        .unwrap_or_else(|e| panic!("invalid table prefix pattern: {e}"))
});

/// Every prefix under which all [`CORE_TABLES`] exist, sorted.
pub fn candidates(tables: &[String]) -> Vec<String> {
    let set: BTreeSet<&str> = tables.iter().map(String::as_str).collect();
    set.iter()
        .filter_map(|table| table.strip_suffix(CORE_TABLES[0]))
        .filter(|prefix| {
            CORE_TABLES[1..]
                .iter()
                .all(|core| set.contains(format!("{prefix}{core}").as_str()))
        })
        .map(str::to_string)
        .collect()
}

/// Live table prefix of an imported database. Plugin tables that merely end
/// in `options` never qualify because the sibling core tables are missing.
pub fn detect(tables: &[String]) -> Option<String> {
    let found = candidates(tables);
    if found.len() > 1 {
        warn!(
            "Several table prefixes carry a full core table set: {:?}; using '{}'",
            found, found[0]
        );
    }
    found.into_iter().next()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    AlreadyAligned,
    Primary,
    Fallback,
}

/// Replace the `$table_prefix` assignment in config file text.
pub fn rewrite_config(text: &str, prefix: &str) -> Option<String> {
    if !TABLE_PREFIX_ASSIGNMENT.is_match(text) {
        return None;
    }
    let replaced = TABLE_PREFIX_ASSIGNMENT.replace(text, |caps: &regex::Captures<'_>| {
        format!("{}'{}'{}", &caps[1], prefix, &caps[5])
    });
    Some(replaced.into_owned())
}

/// Prefix assigned in config file text, if any.
pub fn configured_prefix(text: &str) -> Option<String> {
    TABLE_PREFIX_ASSIGNMENT
        .captures(text)
        .map(|caps| caps[3].to_string())
}

fn valid_prefix(prefix: &str) -> bool {
    !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Write `prefix` into the installation's configuration and verify it.
///
/// The CLI write is tried first. Only if re-reading disagrees is the config
/// file edited directly; that edit is verified too and the original content
/// is put back if verification fails. A successful direct edit leaves the
/// pre-edit file beside it as `wp-config.php.prefix-backup`.
pub fn reconcile(site: &Site, prefix: &str) -> Result<ReconcileOutcome> {
    if !valid_prefix(prefix) {
        return Err(MigrateError::Reconciliation(format!(
            "refusing to configure unusual table prefix '{prefix}'"
        )));
    }
    let wp = Wp::new(site);
    let current = wp.config_get("table_prefix").unwrap_or_default();
    if current == prefix {
        info!("Table prefix already '{}'", prefix);
        return Ok(ReconcileOutcome::AlreadyAligned);
    }
    info!("Reconciling table prefix '{}' -> '{}'", current, prefix);

    match wp.config_set_variable("table_prefix", prefix) {
        Ok(()) => {
            if wp.config_get("table_prefix").ok().as_deref() == Some(prefix) {
                info!("Table prefix set to '{}'", prefix);
                return Ok(ReconcileOutcome::Primary);
            }
            warn!("Table prefix write did not verify, editing {} directly", CONFIG_FILE);
        }
        Err(e) => warn!("Table prefix write failed ({}), editing {} directly", e, CONFIG_FILE),
    }

    fallback_edit(site, &wp, prefix)?;
    Ok(ReconcileOutcome::Fallback)
}

fn fallback_edit(site: &Site, wp: &Wp<'_>, prefix: &str) -> Result<()> {
    let fs = site.fs();
    let config = site.root.join(CONFIG_FILE);
    let original = fs.read(&config)?;
    let text = String::from_utf8_lossy(&original).into_owned();

    let Some(edited) = rewrite_config(&text, prefix) else {
        return Err(MigrateError::Reconciliation(format!(
            "no $table_prefix assignment found in {}",
            config.display()
        )));
    };

    let preserved = site.root.join(format!("{CONFIG_FILE}.prefix-backup"));
    fs.write(&preserved, &original)?;
    debug!("Preserved {} as {}", config.display(), preserved.display());

    let verified = fs.write(&config, edited.as_bytes()).is_ok()
        && wp.config_get("table_prefix").ok().as_deref() == Some(prefix);

    if verified {
        info!(
            "Table prefix set to '{}' by editing {}; previous file kept at {}",
            prefix,
            CONFIG_FILE,
            preserved.display()
        );
        return Ok(());
    }

    error!("Edited {} did not verify, restoring the original", CONFIG_FILE);
    match fs.write(&config, &original) {
        Ok(()) => {
            fs.remove_all(&preserved)?;
            Err(MigrateError::Reconciliation(format!(
                "could not set table prefix '{prefix}'; {} restored unchanged",
                config.display()
            )))
        }
        Err(e) => Err(MigrateError::Reconciliation(format!(
            "could not set table prefix '{prefix}' and restoring {} failed ({e}); original kept at {}",
            config.display(),
            preserved.display()
        ))),
    }
}
