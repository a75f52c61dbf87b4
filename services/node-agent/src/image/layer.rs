//! Single-file lookup inside OCI layer tarballs.
//!
//! Layers are scanned newest first. Within one layer a whiteout only hides
//! content of older layers, so a file present in the same layer still wins.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::warn;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Result of looking for a file in one layer.
#[derive(Debug, PartialEq, Eq)]
pub enum LayerLookup {
    /// The layer carries the file.
    Found(Vec<u8>),
    /// The layer deletes the file from older layers.
    Deleted,
    /// The layer does not touch the file.
    Absent,
}

/// Look for `target` in a (possibly gzip-compressed) layer blob.
pub fn lookup_in_layer_file(layer: &Path, target: &str) -> io::Result<LayerLookup> {
    let mut file = File::open(layer)?;
    let gzip = is_gzip(&mut file)?;
    file.seek(SeekFrom::Start(0))?;

    let reader = BufReader::new(file);
    if gzip {
        lookup_in_layer(GzDecoder::new(reader), target)
    } else {
        lookup_in_layer(reader, target)
    }
}

/// Look for `target` in an uncompressed layer tarball.
pub fn lookup_in_layer<R: Read>(reader: R, target: &str) -> io::Result<LayerLookup> {
    let target = normalize(Path::new(target));
    let mut archive = Archive::new(reader);
    let mut deleted = false;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.into_owned();

        if raw_path
            .components()
            .any(|c| c == Component::ParentDir)
        {
            warn!(path = %raw_path.display(), "Skipping layer entry with parent directory");
            continue;
        }

        let path = normalize(&raw_path);
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let parent = path.parent().unwrap_or(Path::new(""));

        if file_name == OPAQUE_WHITEOUT {
            if target.starts_with(parent) && target != parent {
                deleted = true;
            }
            continue;
        }

        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            if target.starts_with(parent.join(hidden)) {
                deleted = true;
            }
            continue;
        }

        if path == target {
            match entry.header().entry_type() {
                EntryType::Regular | EntryType::Continuous => {
                    let mut data = Vec::with_capacity(entry.size() as usize);
                    entry.read_to_end(&mut data)?;
                    return Ok(LayerLookup::Found(data));
                }
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{} is not a regular file ({other:?})", path.display()),
                    ))
                }
            }
        }
    }

    Ok(if deleted {
        LayerLookup::Deleted
    } else {
        LayerLookup::Absent
    })
}

/// `./usr/bin/x` and `/usr/bin/x` both become `usr/bin/x`.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// Check if a file is gzip compressed.
fn is_gzip(file: &mut File) -> io::Result<bool> {
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == [0x1f, 0x8b]),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
