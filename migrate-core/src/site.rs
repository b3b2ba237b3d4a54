//! One installation taking part in a run, and filesystem access to it.
//!
//! The destination may be this machine or a remote host. [`SiteFs`] hides the
//! difference: [`LocalFs`] works on the real filesystem, [`ShellFs`] issues
//! POSIX shell utilities through the site's command runner.

use anyhow::Context;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use crate::command::{CommandRunner, LocalRunner};
use crate::error::{MigrateError, Result};
use crate::preflight;

pub trait SiteFs {
    fn exists(&self, path: &Path) -> Result<bool>;
    fn is_dir(&self, path: &Path) -> Result<bool>;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    /// Remove a file or a whole tree. Missing paths are not an error.
    fn remove_all(&self, path: &Path) -> Result<()>;
    fn copy_recursive(&self, from: &Path, to: &Path) -> Result<()>;
    /// Entry names in `dir`, sorted. Empty when `dir` does not exist.
    fn list_dir(&self, dir: &Path) -> Result<Vec<String>>;
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
    fn write(&self, path: &Path, data: &[u8]) -> Result<()>;
    /// Compress `plain` into `compressed` and remove `plain`.
    fn gzip(&self, plain: &Path, compressed: &Path) -> Result<()>;
    fn gunzip(&self, compressed: &Path, plain: &Path) -> Result<()>;
    fn size(&self, path: &Path) -> Result<u64>;
    fn free_bytes(&self, path: &Path) -> Result<Option<u64>>;

    fn digest(&self, path: &Path) -> Result<String> {
        Ok(blake3::hash(&self.read(path)?).to_hex().to_string())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

fn copy_tree(source: &Path, target: &Path) -> anyhow::Result<()> {
    let metadata = fs::symlink_metadata(source)
        .with_context(|| format!("Failed to get metadata for: {}", source.display()))?;
    if metadata.file_type().is_symlink() {
        let link_target = fs::read_link(source)
            .with_context(|| format!("Failed to read symlink: {}", source.display()))?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&link_target, target).with_context(|| {
            format!("Failed to create symlink {} -> {}", target.display(), link_target.display())
        })?;
        #[cfg(not(unix))]
        warn!("Skipping symlink {} -> {}", source.display(), link_target.display());
    } else if metadata.is_dir() {
        fs::create_dir_all(target)
            .with_context(|| format!("Failed to create directory {}", target.display()))?;
        let mut entries: Vec<_> = fs::read_dir(source)
            .with_context(|| format!("Failed to read directory {}", source.display()))?
            .collect::<io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            copy_tree(&entry.path(), &target.join(entry.file_name()))?;
        }
    } else if metadata.is_file() {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, target).with_context(|| {
            format!("Failed to copy file from {} to {}", source.display(), target.display())
        })?;
        fs::set_permissions(target, metadata.permissions())
            .with_context(|| format!("Failed to set permissions for: {}", target.display()))?;
    } else {
        debug!("Skipping special file: {}", source.display());
    }
    Ok(())
}

impl SiteFs for LocalFs {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(fs::symlink_metadata(path).is_ok())
    }

    fn is_dir(&self, path: &Path) -> Result<bool> {
        Ok(path.is_dir())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))?;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).with_context(|| {
            format!("Failed to rename {} to {}", from.display(), to.display())
        })?;
        Ok(())
    }

    fn remove_all(&self, path: &Path) -> Result<()> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let removed = if metadata.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        removed.with_context(|| format!("Failed to remove {}", path.display()))?;
        Ok(())
    }

    fn copy_recursive(&self, from: &Path, to: &Path) -> Result<()> {
        copy_tree(from, to)?;
        Ok(())
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<String>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?)
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn gzip(&self, plain: &Path, compressed: &Path) -> Result<()> {
        let mut input = BufReader::new(
            File::open(plain).with_context(|| format!("Failed to open {}", plain.display()))?,
        );
        let output = File::create(compressed)
            .with_context(|| format!("Failed to create {}", compressed.display()))?;
        let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
        io::copy(&mut input, &mut encoder)?;
        encoder.finish()?.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        fs::remove_file(plain)?;
        Ok(())
    }

    fn gunzip(&self, compressed: &Path, plain: &Path) -> Result<()> {
        let input = File::open(compressed)
            .with_context(|| format!("Failed to open {}", compressed.display()))?;
        let mut decoder = GzDecoder::new(BufReader::new(input));
        let mut output = BufWriter::new(
            File::create(plain).with_context(|| format!("Failed to create {}", plain.display()))?,
        );
        io::copy(&mut decoder, &mut output)
            .with_context(|| format!("Failed to decompress {}", compressed.display()))?;
        Ok(())
    }

    fn size(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn free_bytes(&self, path: &Path) -> Result<Option<u64>> {
        Ok(preflight::local_free_bytes(path))
    }

    fn digest(&self, path: &Path) -> Result<String> {
        let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }
}

/// Filesystem operations expressed as shell utilities on the runner's host.
pub struct ShellFs<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> ShellFs<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<crate::command::CommandOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runner.exec(program, &args)?.check(program)
    }

    fn sh(&self, script: &str, args: &[&Path]) -> Result<crate::command::CommandOutput> {
        let mut all = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
        all.extend(args.iter().map(|p| p.display().to_string()));
        self.runner.exec("sh", &all)?.check("sh")
    }

    fn test(&self, flag: &str, path: &Path) -> Result<bool> {
        let out = self
            .runner
            .exec("test", &[flag.to_string(), path.display().to_string()])?;
        Ok(out.success())
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

impl SiteFs for ShellFs<'_> {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.test("-e", path)? || self.test("-L", path)?)
    }

    fn is_dir(&self, path: &Path) -> Result<bool> {
        self.test("-d", path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.run("mkdir", &["-p", &display(path)]).map(|_| ())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.run("mv", &["-T", &display(from), &display(to)]).map(|_| ())
    }

    fn remove_all(&self, path: &Path) -> Result<()> {
        self.run("rm", &["-rf", &display(path)]).map(|_| ())
    }

    fn copy_recursive(&self, from: &Path, to: &Path) -> Result<()> {
        self.run("cp", &["-a", &display(from), &display(to)]).map(|_| ())
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<String>> {
        if !self.is_dir(dir)? {
            return Ok(Vec::new());
        }
        let out = self.run("ls", &["-1A", &display(dir)])?;
        let mut names: Vec<String> = out
            .stdout_text()
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(self.run("cat", &[&display(path)])?.stdout)
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let args = vec![
            "-c".to_string(),
            r#"cat > "$1""#.to_string(),
            "sh".to_string(),
            display(path),
        ];
        self.runner.exec_with_input("sh", &args, data)?.check("sh").map(|_| ())
    }

    fn gzip(&self, plain: &Path, compressed: &Path) -> Result<()> {
        self.sh(r#"gzip -c "$1" > "$2" && rm -f "$1""#, &[plain, compressed])
            .map(|_| ())
    }

    fn gunzip(&self, compressed: &Path, plain: &Path) -> Result<()> {
        self.sh(r#"gzip -dc "$1" > "$2""#, &[compressed, plain]).map(|_| ())
    }

    fn size(&self, path: &Path) -> Result<u64> {
        let out = self.run("wc", &["-c", &display(path)])?;
        out.stdout_text()
            .split_whitespace()
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| MigrateError::Transfer(format!("unreadable size of {}", path.display())))
    }

    fn free_bytes(&self, path: &Path) -> Result<Option<u64>> {
        let out = self.runner.exec("df", &["-Pk".to_string(), display(path)])?;
        if !out.success() {
            warn!("df failed on {}: {}", self.runner.describe(), out.stderr.trim());
            return Ok(None);
        }
        Ok(preflight::parse_df_available(&out.stdout_text()))
    }
}

/// Which end of the run an installation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Source => write!(f, "source"),
            Side::Destination => write!(f, "destination"),
        }
    }
}

/// An installation root reachable through a command runner.
pub struct Site {
    pub side: Side,
    pub root: PathBuf,
    pub wp_bin: String,
    runner: Box<dyn CommandRunner>,
}

impl Site {
    pub fn new(side: Side, root: PathBuf, wp_bin: String, runner: Box<dyn CommandRunner>) -> Self {
        Self {
            side,
            root,
            wp_bin,
            runner,
        }
    }

    pub fn local(side: Side, root: PathBuf, wp_bin: String) -> Self {
        Self::new(side, root, wp_bin, Box::new(LocalRunner))
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn is_remote(&self) -> bool {
        self.runner.is_remote()
    }

    pub fn fs(&self) -> Box<dyn SiteFs + '_> {
        if self.is_remote() {
            Box::new(ShellFs::new(self.runner.as_ref()))
        } else {
            Box::new(LocalFs)
        }
    }

    pub fn content_dir(&self) -> PathBuf {
        self.root.join(crate::content_locator::CONTENT_DIR_NAME)
    }

    pub fn describe(&self) -> String {
        format!("{} {}:{}", self.side, self.runner.describe(), self.root.display())
    }
}
