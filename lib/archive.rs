//! Layer-style tar application and emission.
//!
//! This is the tar producer/consumer the rest of the store builds on: it can
//! apply a layer tarball onto a directory tree (honoring OCI whiteouts) and
//! emit a directory tree as an uncompressed tar with a deterministic entry
//! order. Gzip-compressed inputs are detected by their magic bytes and
//! decompressed transparently.

use std::{
    fs,
    io::{self, BufRead, BufReader, Read, Write},
    path::{Component, Path},
};

use flate2::read::GzDecoder;
use walkdir::WalkDir;

use crate::{OvermountError, OvermountResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The filename prefix marking a whiteout entry in a layer tar
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// The filename marking an opaque directory whiteout in a layer tar
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Wraps `reader` in a gzip decoder when the stream starts with the gzip
/// magic bytes, and returns it buffered but untouched otherwise.
pub fn maybe_decompress<'a, R: Read + 'a>(reader: R) -> OvermountResult<Box<dyn Read + 'a>> {
    let mut reader = BufReader::new(reader);
    let head = reader.fill_buf()?;

    if head.len() >= GZIP_MAGIC.len() && head[..GZIP_MAGIC.len()] == GZIP_MAGIC {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Applies a layer tar from `reader` onto `dir`.
///
/// Whiteout entries are translated instead of extracted: `.wh.<name>` removes
/// `<name>` from the tree and `.wh..wh..opq` clears the containing
/// directory's existing contents. Entries that already exist on disk are
/// skipped, so re-applying a layer onto a populated tree succeeds.
pub fn apply<R: Read>(dir: impl AsRef<Path>, reader: R) -> OvermountResult<()> {
    let dir = dir.as_ref();
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);

    // directory mtimes are applied after extraction; unpacking children
    // would reset them otherwise
    let mut directories = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();

        if path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(OvermountError::InvalidAsset(format!(
                "archive entry {} escapes the extraction root",
                path.display()
            )));
        }

        let name = path.file_name().and_then(|name| name.to_str());

        if name == Some(WHITEOUT_OPAQUE) {
            let target = match path.parent() {
                Some(parent) => dir.join(parent),
                None => dir.to_path_buf(),
            };
            clear_dir(&target)?;
            continue;
        }

        if let Some(original) = name.and_then(|name| name.strip_prefix(WHITEOUT_PREFIX)) {
            let target = match path.parent() {
                Some(parent) => dir.join(parent).join(original),
                None => dir.join(original),
            };
            remove_entry(&target)?;
            continue;
        }

        match entry.unpack_in(dir) {
            Result::Ok(_) => {
                if entry.header().entry_type().is_dir() {
                    directories.push((dir.join(&path), entry.header().mtime().unwrap_or(0)));
                }
            }
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                tracing::debug!("entry {} already exists, skipping", path.display());
            }
            Err(error) => return Err(error.into()),
        }
    }

    for (path, mtime) in directories {
        let mtime = filetime::FileTime::from_unix_time(mtime as i64, 0);
        if let Err(error) = filetime::set_file_mtime(&path, mtime) {
            tracing::warn!(
                "failed to restore mtime of directory {}: {}",
                path.display(),
                error
            );
        }
    }

    Ok(())
}

/// Emits `dir` as an uncompressed tar on `writer`.
///
/// Entries are sorted so that packing the same tree twice yields the same
/// byte stream. Symlinks are preserved as symlinks; fifos and device nodes
/// are emitted as payload-less entries; sockets are skipped.
pub fn write_tree<W: Write>(dir: impl AsRef<Path>, writer: W) -> OvermountResult<()> {
    let dir = dir.as_ref();
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry?;
        let relative = entry.path().strip_prefix(dir)?;
        let file_type = entry.file_type();

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if file_type.is_socket() {
                tracing::debug!("skipping socket {}", entry.path().display());
                continue;
            }
        }

        if file_type.is_dir() || file_type.is_file() || file_type.is_symlink() {
            builder.append_path_with_name(entry.path(), relative)?;
        } else {
            // fifos and device nodes carry no payload
            let metadata = fs::symlink_metadata(entry.path())?;
            let mut header = tar::Header::new_gnu();
            header.set_metadata(&metadata);
            header.set_size(0);
            builder.append_data(&mut header, relative, io::empty())?;
        }
    }

    builder.into_inner()?.flush()?;

    Ok(())
}

/// Removes every entry inside `dir`, creating it when missing.
fn clear_dir(dir: &Path) -> OvermountResult<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        return Ok(());
    }

    for entry in fs::read_dir(dir)? {
        remove_entry(&entry?.path())?;
    }

    Ok(())
}

/// Removes a file, symlink, or directory tree, tolerating absence.
fn remove_entry(path: &Path) -> OvermountResult<()> {
    let metadata = match fs::symlink_metadata(path) {
        Result::Ok(metadata) => metadata,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(error.into()),
    };

    if metadata.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
