use flate2::read::GzDecoder;
use log::debug;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const TAR_BLOCK: usize = 512;
const SNIFF_LEN: usize = TAR_BLOCK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Zip,
    Tar,
    CompressedTar,
    Directory,
    Unknown,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerKind::Zip => "zip",
            ContainerKind::Tar => "tar",
            ContainerKind::CompressedTar => "tar.gz",
            ContainerKind::Directory => "directory",
            ContainerKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Classify a container from its leading bytes.
///
/// Gzip is tested first and only counts as a compressed tar when the
/// decompressed stream itself starts with a tar header, so a bare `.sql.gz`
/// dump is not mistaken for an archive. Zip is matched on its exact
/// local-header signature at offset zero, never by searching for `PK`
/// anywhere in the buffer.
pub fn sniff_bytes(data: &[u8]) -> ContainerKind {
    match data {
        [0x1F, 0x8B, ..] => {
            if gzip_wraps_tar(data) {
                ContainerKind::CompressedTar
            } else {
                ContainerKind::Unknown
            }
        }
        [0x50, 0x4B, 0x03, 0x04, ..] | [0x50, 0x4B, 0x05, 0x06, ..] => ContainerKind::Zip,
        _ if is_tar_header(data) => ContainerKind::Tar,
        _ => ContainerKind::Unknown,
    }
}

fn is_tar_header(data: &[u8]) -> bool {
    // Both POSIX ("ustar\0") and GNU ("ustar  \0") magics share the prefix.
    data.len() >= TAR_BLOCK && &data[257..262] == b"ustar"
}

fn gzip_wraps_tar(data: &[u8]) -> bool {
    let mut decoder = GzDecoder::new(data);
    let mut block = [0u8; TAR_BLOCK];
    let mut filled = 0;
    while filled < TAR_BLOCK {
        match decoder.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => break,
        }
    }
    filled == TAR_BLOCK && is_tar_header(&block)
}

/// Classify a path on disk, independent of its extension.
pub fn sniff(path: &Path) -> io::Result<ContainerKind> {
    if path.is_dir() {
        return Ok(ContainerKind::Directory);
    }

    let kind = {
        let mut file = File::open(path)?;
        let mut head = Vec::with_capacity(SNIFF_LEN);
        (&mut file).take(SNIFF_LEN as u64).read_to_end(&mut head)?;
        match head.as_slice() {
            // Gzip headers need the whole compressed prefix to inflate one block.
            [0x1F, 0x8B, ..] => {
                if gzip_file_wraps_tar(path)? {
                    ContainerKind::CompressedTar
                } else {
                    ContainerKind::Unknown
                }
            }
            _ => sniff_bytes(&head),
        }
    };

    debug!("Sniffed {} as {}", path.display(), kind);
    Ok(kind)
}

fn gzip_file_wraps_tar(path: &Path) -> io::Result<bool> {
    let file = File::open(path)?;
    let mut decoder = GzDecoder::new(file);
    let mut block = [0u8; TAR_BLOCK];
    let mut filled = 0;
    while filled < TAR_BLOCK {
        match decoder.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return Ok(false),
        }
    }
    Ok(filled == TAR_BLOCK && is_tar_header(&block))
}
