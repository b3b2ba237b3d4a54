use anyhow::Context;
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{MigrateError, Result};
use crate::path_safety;
use crate::sniff::{self, ContainerKind};

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink { target: PathBuf },
}

/// One table-of-contents entry, named as the archive names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
}

impl ArchiveEntry {
    /// Entry name with `/` separators and no leading `./` or trailing `/`.
    pub fn name(&self) -> String {
        normalize_name(&self.path.to_string_lossy())
    }
}

fn normalize_name(raw: &str) -> String {
    let unified = raw.replace('\\', "/");
    let mut name = unified.as_str();
    while let Some(rest) = name.strip_prefix("./") {
        name = rest;
    }
    name.trim_end_matches('/').to_string()
}

/// Reports `(entries_done, entries_total)` while unpacking.
pub type ProgressObserver<'a> = &'a dyn Fn(usize, usize);

/// A backup input: a single container file or an already-extracted tree.
#[derive(Debug, Clone)]
pub struct Archive {
    pub path: PathBuf,
    pub kind: ContainerKind,
    pub size: u64,
}

impl Archive {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MigrateError::UserInput(format!(
                "archive not found: {}",
                path.display()
            )));
        }

        let kind = sniff::sniff(path)?;
        let size = if kind == ContainerKind::Directory {
            WalkDir::new(path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum()
        } else {
            fs::metadata(path)?.len()
        };

        info!(
            "Archive {}: container={}, size={} bytes",
            path.display(),
            kind,
            size
        );
        Ok(Self {
            path: path.to_path_buf(),
            kind,
            size,
        })
    }

    /// Table of contents without unpacking anything.
    pub fn entries(&self) -> Result<Vec<ArchiveEntry>> {
        match self.kind {
            ContainerKind::Zip => list_zip(&self.path),
            ContainerKind::Tar => list_tar(File::open(&self.path)?),
            ContainerKind::CompressedTar => list_tar(GzDecoder::new(File::open(&self.path)?)),
            ContainerKind::Directory => list_directory(&self.path),
            ContainerKind::Unknown => Err(MigrateError::UserInput(format!(
                "{} is not a zip, tar, tar.gz or directory",
                self.path.display()
            ))),
        }
    }

    /// Normalized entry names, the form every adapter fingerprints against.
    pub fn entry_names(&self) -> Result<Vec<String>> {
        Ok(self
            .entries()?
            .iter()
            .map(ArchiveEntry::name)
            .filter(|n| !n.is_empty())
            .collect())
    }

    /// Unpack into `dest` and return the root holding the backup contents.
    ///
    /// Both safety passes run unconditionally. A directory input is scanned
    /// in place and returned as-is; nothing is copied or written.
    pub fn extract(&self, dest: &Path, progress: Option<ProgressObserver<'_>>) -> Result<PathBuf> {
        let entries = self.entries()?;
        path_safety::ensure_entries_safe(&entries)?;

        if self.kind == ContainerKind::Directory {
            path_safety::ensure_tree_safe(&self.path)?;
            return Ok(self.path.clone());
        }

        fs::create_dir_all(dest)
            .with_context(|| format!("Failed to create extraction directory: {}", dest.display()))?;
        info!(
            "Extracting {} entries from {} into {}",
            entries.len(),
            self.path.display(),
            dest.display()
        );

        let total = entries.len();
        let mut unpacker = Unpacker {
            root: dest,
            deferred_links: Vec::new(),
            done: 0,
            total,
            progress,
        };

        match self.kind {
            ContainerKind::Zip => unpacker.unpack_zip(&self.path)?,
            ContainerKind::Tar => unpacker.unpack_tar(File::open(&self.path)?)?,
            ContainerKind::CompressedTar => {
                unpacker.unpack_tar(GzDecoder::new(File::open(&self.path)?))?
            }
            ContainerKind::Directory | ContainerKind::Unknown => {
                return Err(MigrateError::UserInput(format!(
                    "cannot unpack {} as {}",
                    self.path.display(),
                    self.kind
                )))
            }
        }
        unpacker.create_deferred_links()?;

        path_safety::ensure_tree_safe(dest)?;
        info!("Extraction complete: {} entries", unpacker.done);
        Ok(dest.to_path_buf())
    }
}

fn list_zip(path: &Path) -> Result<Vec<ArchiveEntry>> {
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(corrupted)?;
    let mut entries = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(corrupted)?;
        let name = file.name().to_string();
        let kind = if file.is_dir() {
            EntryKind::Directory
        } else if is_zip_symlink(file.unix_mode()) {
            let mut target = String::new();
            file.read_to_string(&mut target)?;
            EntryKind::Symlink {
                target: PathBuf::from(target),
            }
        } else {
            EntryKind::File
        };
        entries.push(ArchiveEntry {
            path: PathBuf::from(name),
            kind,
            size: file.size(),
        });
    }

    Ok(entries)
}

fn is_zip_symlink(mode: Option<u32>) -> bool {
    mode.is_some_and(|m| m & S_IFMT == S_IFLNK)
}

fn list_tar<R: Read>(reader: R) -> Result<Vec<ArchiveEntry>> {
    let mut archive = tar::Archive::new(reader);
    let mut entries = Vec::new();

    for entry in archive.entries()? {
        let entry = entry?;
        // Raw header bytes: `path()` would already reject some hostile names.
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let header = entry.header();
        let entry_type = header.entry_type();
        let kind = if entry_type.is_dir() {
            EntryKind::Directory
        } else if entry_type.is_symlink() || entry_type.is_hard_link() {
            let target = entry
                .link_name_bytes()
                .map(|b| PathBuf::from(String::from_utf8_lossy(&b).into_owned()))
                .unwrap_or_default();
            EntryKind::Symlink { target }
        } else {
            EntryKind::File
        };
        entries.push(ArchiveEntry {
            path: PathBuf::from(name),
            kind,
            size: header.size().unwrap_or(0),
        });
    }

    Ok(entries)
}

fn list_directory(root: &Path) -> Result<Vec<ArchiveEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| MigrateError::Io(io::Error::other(e.to_string())))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        let file_type = entry.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink {
                target: fs::read_link(entry.path())?,
            }
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        entries.push(ArchiveEntry {
            path: relative,
            kind,
            size,
        });
    }
    Ok(entries)
}

fn corrupted(e: zip::result::ZipError) -> MigrateError {
    MigrateError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("corrupted zip archive: {e}"),
    ))
}

struct Unpacker<'a> {
    root: &'a Path,
    deferred_links: Vec<(PathBuf, PathBuf)>,
    done: usize,
    total: usize,
    progress: Option<ProgressObserver<'a>>,
}

impl<'a> Unpacker<'a> {
    fn tick(&mut self) {
        self.done += 1;
        if let Some(observer) = self.progress {
            observer(self.done, self.total);
        }
    }

    fn write_file<R: Read>(&self, name: &str, reader: &mut R, mode: Option<u32>) -> Result<()> {
        let target = path_safety::resolve_within(self.root, Path::new(name))?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create parent directory for: {}", target.display())
            })?;
        }
        let mut out = File::create(&target)
            .with_context(|| format!("Failed to create file: {}", target.display()))?;
        io::copy(reader, &mut out)
            .with_context(|| format!("Failed to write file: {}", target.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = mode {
                // Never carry setuid/setgid/sticky bits out of a third-party archive.
                let perms = fs::Permissions::from_mode((mode & 0o777) | 0o600);
                fs::set_permissions(&target, perms)?;
            }
        }
        #[cfg(not(unix))]
        let _ = mode;

        debug!("Extracted file: {}", name);
        Ok(())
    }

    fn make_dir(&self, name: &str) -> Result<()> {
        let target = path_safety::resolve_within(self.root, Path::new(name))?;
        fs::create_dir_all(&target)
            .with_context(|| format!("Failed to create directory: {}", target.display()))?;
        Ok(())
    }

    fn unpack_zip(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path)?;
        let mut archive = zip::ZipArchive::new(file).map_err(corrupted)?;

        for i in 0..archive.len() {
            let mut file = archive.by_index(i).map_err(corrupted)?;
            let name = normalize_name(file.name());
            if name.is_empty() {
                self.tick();
                continue;
            }
            if file.is_dir() {
                self.make_dir(&name)?;
            } else if is_zip_symlink(file.unix_mode()) {
                let mut target = String::new();
                file.read_to_string(&mut target)?;
                self.deferred_links
                    .push((PathBuf::from(&name), PathBuf::from(target)));
            } else {
                let mode = file.unix_mode();
                self.write_file(&name, &mut file, mode)?;
            }
            self.tick();
        }
        Ok(())
    }

    fn unpack_tar<R: Read>(&mut self, reader: R) -> Result<()> {
        let mut archive = tar::Archive::new(reader);

        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = normalize_name(&String::from_utf8_lossy(&entry.path_bytes()));
            let entry_type = entry.header().entry_type();
            if name.is_empty() {
                self.tick();
                continue;
            }

            if entry_type.is_dir() {
                self.make_dir(&name)?;
            } else if entry_type.is_symlink() {
                let target = entry
                    .link_name_bytes()
                    .map(|b| PathBuf::from(String::from_utf8_lossy(&b).into_owned()))
                    .unwrap_or_default();
                self.deferred_links.push((PathBuf::from(&name), target));
            } else if entry_type.is_file() {
                let mode = entry.header().mode().ok();
                self.write_file(&name, &mut entry, mode)?;
            } else {
                warn!("Skipping unsupported tar entry type {:?}: {}", entry_type, name);
            }
            self.tick();
        }
        Ok(())
    }

    /// Links are created last so that no later entry can be written through one.
    fn create_deferred_links(&mut self) -> Result<()> {
        for (name, target) in std::mem::take(&mut self.deferred_links) {
            let link = path_safety::resolve_within(self.root, &name)?;
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent)?;
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &link).with_context(|| {
                format!(
                    "Failed to create symlink from {} to {}",
                    link.display(),
                    target.display()
                )
            })?;
            #[cfg(not(unix))]
            warn!(
                "Symlinks are not supported on this platform, skipping {} -> {}",
                link.display(),
                target.display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Archive builders shared by the unit tests of several modules.

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::path::Path;
    use zip::write::SimpleFileOptions;

    pub fn write_zip(path: &Path, files: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        for (name, content) in files {
            if name.ends_with('/') {
                writer.add_directory(name.trim_end_matches('/'), options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    fn tar_bytes(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            // Written straight into the header so hostile names survive.
            let bytes = name.as_bytes();
            header.as_old_mut().name[..bytes.len()].copy_from_slice(bytes);
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_cksum();
            builder.append(&header, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    pub fn write_tar(path: &Path, files: &[(&str, &str)]) {
        std::fs::write(path, tar_bytes(files)).unwrap();
    }

    pub fn write_tar_gz(path: &Path, files: &[(&str, &str)]) {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes(files)).unwrap();
        std::fs::write(path, encoder.finish().unwrap()).unwrap();
    }

    pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
        for (name, content) in files {
            let path = root.join(name);
            if name.ends_with('/') {
                std::fs::create_dir_all(&path).unwrap();
            } else {
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(&path, content).unwrap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("./wp-content/"), "wp-content");
        assert_eq!(normalize_name("sql\\wp_posts.sql"), "sql/wp_posts.sql");
        assert_eq!(normalize_name("././a/b"), "a/b");
    }

    #[test]
    fn test_zip_listing_and_extraction() {
        let temp_dir = TempDir::new().unwrap();
        let zip_path = temp_dir.path().join("site.zip");
        write_zip(
            &zip_path,
            &[
                ("wp-content/", ""),
                ("wp-content/themes/style.css", "body{}"),
                ("database.sql", "SELECT 1;"),
            ],
        );

        let archive = Archive::open(&zip_path).unwrap();
        assert_eq!(archive.kind, ContainerKind::Zip);
        let names = archive.entry_names().unwrap();
        assert!(names.contains(&"wp-content/themes/style.css".to_string()));

        let dest = temp_dir.path().join("out");
        let seen = Cell::new(0usize);
        let observer = |done: usize, _total: usize| seen.set(done);
        let root = archive.extract(&dest, Some(&observer)).unwrap();
        assert_eq!(root, dest);
        assert_eq!(
            fs::read_to_string(dest.join("wp-content/themes/style.css")).unwrap(),
            "body{}"
        );
        assert_eq!(seen.get(), 3);
    }

    #[test]
    fn test_tar_gz_extraction() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backup.tar.gz");
        write_tar_gz(&path, &[("sql/wp_posts.sql", "INSERT;"), ("meta.json", "{}")]);

        let archive = Archive::open(&path).unwrap();
        assert_eq!(archive.kind, ContainerKind::CompressedTar);
        let dest = temp_dir.path().join("out");
        archive.extract(&dest, None).unwrap();
        assert_eq!(
            fs::read_to_string(dest.join("sql/wp_posts.sql")).unwrap(),
            "INSERT;"
        );
    }

    #[test]
    fn test_traversal_entry_fails_before_any_write() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("evil.tar");
        write_tar(&path, &[("ok.txt", "fine"), ("../escaped.txt", "pwned")]);

        let archive = Archive::open(&path).unwrap();
        let dest = temp_dir.path().join("nested").join("out");
        let err = archive.extract(&dest, None).unwrap_err();
        assert!(matches!(err, MigrateError::SecurityValidation { .. }));
        assert!(!temp_dir.path().join("nested/escaped.txt").exists());
        assert!(!dest.exists());
    }

    #[test]
    fn test_zip_with_absolute_entry_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("evil.zip");
        write_zip(&path, &[("/tmp/evil.php", "<?php")]);

        let archive = Archive::open(&path).unwrap();
        let err = archive.extract(&temp_dir.path().join("out"), None).unwrap_err();
        assert!(matches!(err, MigrateError::SecurityValidation { .. }));
    }

    #[test]
    fn test_directory_input_is_used_in_place() {
        let temp_dir = TempDir::new().unwrap();
        let tree = temp_dir.path().join("extracted");
        write_tree(&tree, &[("wp-content/uploads/", ""), ("db.sql", "x")]);

        let archive = Archive::open(&tree).unwrap();
        assert_eq!(archive.kind, ContainerKind::Directory);
        assert_eq!(archive.size, 1);
        let scratch = temp_dir.path().join("scratch");
        let root = archive.extract(&scratch, None).unwrap();
        assert_eq!(root, tree);
        assert!(!scratch.exists());
    }

    #[test]
    fn test_unknown_container_is_refused_without_writing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backup.zip");
        fs::write(&path, "not an archive at all").unwrap();

        let archive = Archive::open(&path).unwrap();
        assert_eq!(archive.kind, ContainerKind::Unknown);
        let dest = temp_dir.path().join("out");
        let err = archive.extract(&dest, None).unwrap_err();
        assert!(matches!(err, MigrateError::UserInput(_)));
        assert_eq!(err.exit_code(), 2);
        assert!(!dest.exists());
    }
}
