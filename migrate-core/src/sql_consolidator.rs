use anyhow::Context;
use log::{debug, info};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::error::{MigrateError, Result};

/// Merges per-table dump files into one importable file.
///
/// Files are ordered lexicographically. Table dependency order is not modelled;
/// the dumps disable foreign-key checks themselves.
#[derive(Debug, Clone)]
pub struct SqlConsolidator {
    pub extension: &'static str,
    pub recursive: bool,
    pub min_files: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidationReport {
    pub output: PathBuf,
    pub files: Vec<PathBuf>,
    pub bytes: u64,
}

impl SqlConsolidator {
    pub fn new(min_files: usize) -> Self {
        Self {
            extension: "sql",
            recursive: false,
            min_files: min_files.max(1),
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn collect(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let max_depth = if self.recursive { usize::MAX } else { 1 };
        let mut files: Vec<PathBuf> = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(max_depth)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().is_some_and(|ext| ext == self.extension))
            .collect();
        files.sort_by(|a, b| {
            let ra = a.strip_prefix(dir).unwrap_or(a);
            let rb = b.strip_prefix(dir).unwrap_or(b);
            ra.cmp(rb)
        });
        Ok(files)
    }

    /// Concatenate every matching file in `dir` into `output` with exactly one
    /// blank line between consecutive files, whether or not a file ends in a
    /// newline. The output appears all at once or not at all.
    pub fn consolidate(&self, dir: &Path, output: &Path) -> Result<ConsolidationReport> {
        let files: Vec<PathBuf> = self
            .collect(dir)?
            .into_iter()
            .filter(|f| f != output)
            .collect();

        if files.is_empty() {
            return Err(MigrateError::Import(format!(
                "no .{} dump files found in {}",
                self.extension,
                dir.display()
            )));
        }
        if files.len() < self.min_files {
            return Err(MigrateError::Import(format!(
                "found {} .{} files in {}, expected at least {}",
                files.len(),
                self.extension,
                dir.display(),
                self.min_files
            )));
        }

        let parent = output.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let mut staged = NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to stage consolidated dump in {}", parent.display()))?;

        let mut out = TailWriter::new(staged.as_file_mut());
        for file in &files {
            out.separate()?;
            let mut input = File::open(file)
                .with_context(|| format!("Failed to open dump file: {}", file.display()))?;
            io::copy(&mut input, &mut out)?;
            debug!("Consolidated {}", file.display());
        }
        out.flush()?;
        let bytes = out.written;
        staged.flush()?;
        staged
            .persist(output)
            .map_err(|e| MigrateError::Io(e.error))?;

        info!(
            "Consolidated {} dump files ({} bytes) into {}",
            files.len(),
            bytes,
            output.display()
        );
        Ok(ConsolidationReport {
            output: output.to_path_buf(),
            files,
            bytes,
        })
    }
}

/// Counts bytes and remembers the last two written, so separators can top up
/// whatever newlines a file already ends with.
struct TailWriter<W> {
    inner: W,
    tail: [u8; 2],
    written: u64,
}

impl<W: Write> TailWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            tail: [0; 2],
            written: 0,
        }
    }

    fn separate(&mut self) -> io::Result<()> {
        if self.written == 0 {
            return Ok(());
        }
        let missing: &[u8] = match self.tail {
            [b'\n', b'\n'] => b"",
            [_, b'\n'] if self.written > 1 => b"\n",
            [_, b'\n'] => b"",
            _ => b"\n\n",
        };
        self.write_all(missing)
    }
}

impl<W: Write> Write for TailWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        match n {
            0 => {}
            1 => self.tail = [self.tail[1], buf[0]],
            _ => self.tail = [buf[n - 2], buf[n - 1]],
        }
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
