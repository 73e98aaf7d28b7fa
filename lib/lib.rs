//! `overmount` is a container-image layer store and overlay composition
//! engine.
//!
//! # Overview
//!
//! overmount persists each image layer's root filesystem (or its tar
//! representation) in a content-addressable repository on disk, tracks
//! parent-child relationships between layers, and composes an image at
//! runtime by stacking those layers through the kernel's overlay filesystem
//! to present a single merged rootfs. It handles:
//!
//! - Layer storage in materialized (unpacked tree) or virtual (cached
//!   tarball) mode
//! - Digest-authenticated tar pack/unpack with streaming SHA-256
//! - Parent chain persistence and restoration
//! - Overlay mount lifecycle with guaranteed workdir cleanup
//! - Docker-v1 archive import/export and OCI image-layout export
//!
//! # Usage Example
//!
//! ```no_run
//! use overmount::{codec::Docker, Repository};
//!
//! fn main() -> overmount::OvermountResult<()> {
//!     let repository = Repository::new("/var/lib/overmount", false)?;
//!
//!     let archive = std::fs::File::open("image.tar")?;
//!     let tops = repository.import(&Docker::new(), archive)?;
//!
//!     let image = repository.new_image(tops[0].clone());
//!     let merged = image.mount()?;
//!     println!("rootfs at {}", merged.display());
//!     image.unmount()?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`repository`] - The synchronized layer registry and mount factory
//! - [`layer`] - The persistent layer node and its parent chain
//! - [`image`] - Composition of a layer chain into one overlay view
//! - [`mount`] - The kernel overlay mount wrapper
//! - [`asset`] - Digest-teed pack and unpack
//! - [`archive`] - Whiteout-aware tar application and emission
//! - [`codec`] - Docker-v1 and OCI image codecs
//! - [`cli`] - Command-line interface and argument parsing
//! - [`utils`] - Path guard, digest helpers, environment resolution
//!
//! # Platform Support
//!
//! The store itself works on any unix; composing overlay mounts requires a
//! linux kernel.

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod archive;
pub mod asset;
pub mod cli;
pub mod codec;
pub mod image;
pub mod layer;
pub mod mount;
pub mod repository;
pub mod utils;

pub use asset::{Asset, AssetKind, Digester};
pub use error::*;
pub use image::Image;
pub use layer::Layer;
pub use mount::Mount;
pub use repository::Repository;
