//! Zip-slip defence for backup archives.
//!
//! Two passes guard every extraction: a cheap table-of-contents scan before any
//! byte is written, and a resolved-path scan of the extracted tree afterwards.
//! Symlinks created during extraction can redirect later writes or point at
//! files outside the root, which only the second pass can see.

use log::{debug, warn};
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::archive::{ArchiveEntry, EntryKind};
use crate::error::{MigrateError, Result, UnsafeEntry, UnsafeReason};

/// Classify a raw entry name as written in the archive.
///
/// Backslashes are treated as separators so that archives produced on Windows
/// cannot smuggle `..\..\` past the check.
pub fn check_entry_name(name: &str) -> Option<UnsafeReason> {
    let unified = name.replace('\\', "/");
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return Some(UnsafeReason::AbsolutePath);
    }
    if unified.split('/').any(|segment| segment == "..") {
        return Some(UnsafeReason::ParentTraversal);
    }
    None
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Pre-extraction scan over an archive's table of contents.
///
/// Every offending entry is reported, not only the first one.
pub fn scan_entries(entries: &[ArchiveEntry]) -> std::result::Result<(), Vec<UnsafeEntry>> {
    let mut unsafe_entries = Vec::new();

    for entry in entries {
        let name = entry.path.to_string_lossy();
        if let Some(reason) = check_entry_name(&name) {
            unsafe_entries.push(UnsafeEntry {
                path: entry.path.clone(),
                reason,
            });
            continue;
        }

        if let EntryKind::Symlink { target } = &entry.kind {
            if let Some(resolved) = symlink_escape(&entry.path, target) {
                unsafe_entries.push(UnsafeEntry {
                    path: entry.path.clone(),
                    reason: UnsafeReason::SymlinkEscape { resolved },
                });
            }
        }
    }

    if unsafe_entries.is_empty() {
        Ok(())
    } else {
        Err(unsafe_entries)
    }
}

/// Returns the lexically resolved target when a symlink would leave its root.
fn symlink_escape(link: &Path, target: &Path) -> Option<PathBuf> {
    let target_str = target.to_string_lossy().replace('\\', "/");
    if target_str.starts_with('/') || has_drive_prefix(&target_str) {
        return Some(PathBuf::from(target_str));
    }

    let base = link.parent().unwrap_or_else(|| Path::new(""));
    let joined = base.join(&target_str);
    let mut depth: i64 = 0;
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Some(joined);
                }
            }
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return Some(joined),
        }
    }
    None
}

/// Post-extraction scan: every file's real path must stay under `root`.
pub fn scan_tree(root: &Path) -> std::result::Result<(), Vec<UnsafeEntry>> {
    let canonical_root = match root.canonicalize() {
        Ok(p) => p,
        Err(e) => {
            warn!("Cannot resolve extraction root {}: {}", root.display(), e);
            return Err(vec![UnsafeEntry {
                path: root.to_path_buf(),
                reason: UnsafeReason::OutsideRoot {
                    resolved: root.to_path_buf(),
                },
            }]);
        }
    };

    let mut unsafe_entries = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                warn!("Unreadable entry during safety scan: {}", path.display());
                unsafe_entries.push(resolved_outside(&path));
                continue;
            }
        };

        let path = entry.path();
        let is_symlink = entry.path_is_symlink();
        let resolved = match path.canonicalize() {
            Ok(p) => p,
            // Dangling symlink: judge the link text itself.
            Err(_) if is_symlink => match fs::read_link(path) {
                Ok(target) => {
                    let relative = path.strip_prefix(root).unwrap_or(path);
                    match symlink_escape(relative, &target) {
                        Some(resolved) => {
                            unsafe_entries.push(UnsafeEntry {
                                path: path.to_path_buf(),
                                reason: UnsafeReason::SymlinkEscape { resolved },
                            });
                        }
                        None => debug!("Dangling symlink inside root: {}", path.display()),
                    }
                    continue;
                }
                Err(_) => {
                    unsafe_entries.push(resolved_outside(path));
                    continue;
                }
            },
            Err(_) => {
                unsafe_entries.push(resolved_outside(path));
                continue;
            }
        };

        if !resolved.starts_with(&canonical_root) {
            let reason = if is_symlink {
                UnsafeReason::SymlinkEscape { resolved }
            } else {
                UnsafeReason::OutsideRoot { resolved }
            };
            unsafe_entries.push(UnsafeEntry {
                path: path.to_path_buf(),
                reason,
            });
        }
    }

    if unsafe_entries.is_empty() {
        Ok(())
    } else {
        Err(unsafe_entries)
    }
}

fn resolved_outside(path: &Path) -> UnsafeEntry {
    UnsafeEntry {
        path: path.to_path_buf(),
        reason: UnsafeReason::OutsideRoot {
            resolved: path.to_path_buf(),
        },
    }
}

/// Fatal form of [`scan_entries`].
pub fn ensure_entries_safe(entries: &[ArchiveEntry]) -> Result<()> {
    scan_entries(entries).map_err(|entries| MigrateError::SecurityValidation { entries })
}

/// Fatal form of [`scan_tree`].
pub fn ensure_tree_safe(root: &Path) -> Result<()> {
    scan_tree(root).map_err(|entries| MigrateError::SecurityValidation { entries })
}

/// Join `relative` onto `root` and make sure the nearest existing ancestor of
/// the result really lives under `root`. Used right before each write so a
/// symlinked directory cannot redirect the write elsewhere.
pub fn resolve_within(root: &Path, relative: &Path) -> Result<PathBuf> {
    let name = relative.to_string_lossy();
    if let Some(reason) = check_entry_name(&name) {
        return Err(MigrateError::SecurityValidation {
            entries: vec![UnsafeEntry {
                path: relative.to_path_buf(),
                reason,
            }],
        });
    }

    let target = root.join(relative);
    let canonical_root = root.canonicalize()?;
    let mut probe = target.parent().map(Path::to_path_buf);
    while let Some(candidate) = probe {
        if candidate.exists() {
            let real = candidate.canonicalize()?;
            if !real.starts_with(&canonical_root) {
                return Err(MigrateError::SecurityValidation {
                    entries: vec![UnsafeEntry {
                        path: relative.to_path_buf(),
                        reason: UnsafeReason::SymlinkEscape { resolved: real },
                    }],
                });
            }
            break;
        }
        probe = candidate.parent().map(Path::to_path_buf);
    }
    Ok(target)
}
