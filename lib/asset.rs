//! Assets bind an on-disk location to a rolling digester.
//!
//! An asset is either a materialized rootfs tree or a cached layer tarball
//! (virtual mode). Packing and unpacking tee every byte of the tar stream
//! through the digester, so [`Asset::digest`] always reflects the diff-ID of
//! the most recent operation.

use std::{
    fs,
    io::{self, Read, Write},
    path::PathBuf,
    sync::{Mutex, MutexGuard, PoisonError},
};

use getset::Getters;
use sha2::{Digest, Sha256};

use crate::{
    archive,
    utils::{self, check_dir},
    OvermountError, OvermountResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A resettable streaming digester. A tagged variant selected at layer
/// creation; SHA-256 is the only algorithm the store produces today.
#[derive(Debug, Clone)]
pub enum Digester {
    /// Streaming SHA-256.
    Sha256(Sha256),
}

/// The storage form an asset binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    /// A materialized root filesystem directory.
    Tree,

    /// A cached layer tarball (virtual mode).
    Blob,
}

/// A filesystem path tied to a rolling hash digester.
#[derive(Debug, Getters)]
#[getset(get = "pub")]
pub struct Asset {
    /// The path the asset binds: a rootfs directory or a tarball location.
    path: PathBuf,

    /// The storage form of the asset.
    kind: AssetKind,

    #[getset(skip)]
    digester: Mutex<Digester>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Digester {
    /// Creates a fresh SHA-256 digester.
    pub fn sha256() -> Self {
        Self::Sha256(Sha256::new())
    }

    /// Discards all accumulated state.
    pub fn reset(&mut self) {
        match self {
            Self::Sha256(hasher) => *hasher = Sha256::new(),
        }
    }

    /// Feeds `bytes` into the digester.
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(hasher) => hasher.update(bytes),
        }
    }

    /// Returns the prefixed digest of the bytes consumed so far without
    /// disturbing the rolling state.
    pub fn digest(&self) -> String {
        match self {
            Self::Sha256(hasher) => utils::to_digest(&hex::encode(hasher.clone().finalize())),
        }
    }
}

impl Asset {
    /// Binds `path` to a digester. The path itself must not be a symlink.
    pub fn new(
        path: impl Into<PathBuf>,
        kind: AssetKind,
        digester: Digester,
    ) -> OvermountResult<Self> {
        let path = path.into();

        if fs::symlink_metadata(&path).is_ok_and(|metadata| metadata.file_type().is_symlink()) {
            return Err(OvermountError::InvalidAsset(format!(
                "cannot operate on a symlink: {}",
                path.display()
            )));
        }

        Ok(Self {
            path,
            kind,
            digester: Mutex::new(digester),
        })
    }

    /// Returns the digest of the most recent pack or unpack. Before any such
    /// operation this equals the empty-input digest.
    pub fn digest(&self) -> String {
        self.lock_digester().digest()
    }

    /// Discards the current digester state.
    pub fn reset_digest(&self) {
        self.lock_digester().reset();
    }

    /// Extracts the layer tar in `reader` onto the asset path and returns the
    /// digest of the (decompressed) stream.
    ///
    /// In blob form the stream is cached to disk instead of extracted.
    pub fn unpack<R: Read>(&self, reader: R) -> OvermountResult<String> {
        let mut digester = self.lock_digester();
        digester.reset();

        match self.kind {
            AssetKind::Tree => {
                check_dir(&self.path, OvermountError::InvalidAsset)?;

                let decompressed = archive::maybe_decompress(reader)?;
                let mut tee = DigestReader {
                    inner: decompressed,
                    digester: &mut digester,
                };

                archive::apply(&self.path, &mut tee)?;

                // the archive trailer counts toward the diff-ID
                io::copy(&mut tee, &mut io::sink())?;
            }
            AssetKind::Blob => {
                if let Some(parent) = self.path.parent() {
                    fs::create_dir_all(parent)?;
                }

                let decompressed = archive::maybe_decompress(reader)?;
                let mut tee = DigestReader {
                    inner: decompressed,
                    digester: &mut digester,
                };

                let mut file = fs::File::create(&self.path)?;
                io::copy(&mut tee, &mut file)?;
            }
        }

        Ok(digester.digest())
    }

    /// Produces an uncompressed tar of the asset on `writer` and returns its
    /// digest. In blob form this is a copy of the cached tarball.
    pub fn pack<W: Write>(&self, writer: W) -> OvermountResult<String> {
        let mut digester = self.lock_digester();
        digester.reset();

        match self.kind {
            AssetKind::Tree => {
                check_dir(&self.path, OvermountError::InvalidAsset)?;

                let mut tee = DigestWriter {
                    inner: writer,
                    digester: &mut digester,
                };

                archive::write_tree(&self.path, &mut tee)?;
            }
            AssetKind::Blob => {
                let mut file = fs::File::open(&self.path).map_err(|error| {
                    OvermountError::InvalidAsset(format!(
                        "missing cached tarball {}: {}",
                        self.path.display(),
                        error
                    ))
                })?;

                let mut tee = DigestWriter {
                    inner: writer,
                    digester: &mut digester,
                };

                io::copy(&mut file, &mut tee)?;
                tee.flush()?;
            }
        }

        Ok(digester.digest())
    }

    /// Re-derives the digest by running a pack against a discard sink. Used
    /// to recover digest state after a process restart.
    pub fn load_digest(&self) -> OvermountResult<String> {
        self.pack(io::sink())
    }

    /// Clones the current rolling digester state.
    pub(crate) fn digester_snapshot(&self) -> Digester {
        self.lock_digester().clone()
    }

    /// Replaces the rolling digester state, carrying a digest computed
    /// through another asset over to this one.
    pub(crate) fn set_digester(&self, digester: Digester) {
        *self.lock_digester() = digester;
    }

    fn lock_digester(&self) -> MutexGuard<'_, Digester> {
        self.digester.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//--------------------------------------------------------------------------------------------------
// Types: Tee adapters
//--------------------------------------------------------------------------------------------------

struct DigestReader<'a, R> {
    inner: R,
    digester: &'a mut Digester,
}

struct DigestWriter<'a, W> {
    inner: W,
    digester: &'a mut Digester,
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for Digester {
    fn default() -> Self {
        Self::sha256()
    }
}

impl<R: Read> Read for DigestReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.digester.update(&buf[..read]);
        io::Result::Ok(read)
    }
}

impl<W: Write> Write for DigestWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.digester.update(&buf[..written]);
        io::Result::Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
