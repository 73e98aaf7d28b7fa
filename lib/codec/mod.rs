//! Image I/O codecs.
//!
//! Codecs translate between the layer graph and on-the-wire image formats.
//! Importers consume an archive stream and register its layers; exporters
//! assemble an archive on a background producer and hand back the read half
//! of a pipe.

use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use crate::{layer::Layer, repository::Repository, OvermountResult};

mod docker;
mod oci;
mod pipe;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use docker::*;
pub use oci::*;
pub use pipe::PipeReader;

pub(crate) use pipe::PipeWriter;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Converts an archive stream into layers registered with a repository.
pub trait Importer {
    /// Imports the archive in `reader`, returning the top layer of each image
    /// it contained.
    fn import(
        &self,
        repository: &Repository,
        reader: Box<dyn Read + Send>,
    ) -> OvermountResult<Vec<Arc<Layer>>>;
}

/// Converts a layer chain into an archive stream.
pub trait Exporter {
    /// Exports `layer` and its parent chain, tagged with `refs`, as a
    /// streaming reader. Producer failures surface as read errors.
    fn export(
        &self,
        repository: &Repository,
        layer: &Arc<Layer>,
        refs: &[String],
    ) -> OvermountResult<PipeReader>;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

pub(crate) fn append_dir<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    mode: u32,
) -> OvermountResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_mode(mode);
    header.set_size(0);
    builder.append_data(&mut header, name, io::empty())?;

    Ok(())
}

pub(crate) fn append_bytes<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    mode: u32,
    contents: &[u8],
) -> OvermountResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(mode);
    header.set_size(contents.len() as u64);
    builder.append_data(&mut header, name, contents)?;

    Ok(())
}

pub(crate) fn append_stream<W: Write, R: Read>(
    builder: &mut tar::Builder<W>,
    name: &str,
    mode: u32,
    size: u64,
    reader: &mut R,
) -> OvermountResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(mode);
    header.set_size(size);
    builder.append_data(&mut header, name, reader)?;

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Test Fixtures
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use std::{collections::HashMap, fs};

    use oci_spec::image::ImageConfiguration;

    use super::*;

    /// Creates a two-layer chain with materialized content and a config on
    /// the top layer.
    pub(crate) fn populate_repository(repository: &Repository) -> anyhow::Result<Arc<Layer>> {
        fs::create_dir_all(repository.layer_path("root-layer").join("rootfs"))?;
        fs::create_dir_all(repository.layer_path("top-layer").join("rootfs"))?;

        let root = repository.create_layer("root-layer", None)?;
        fs::write(root.path().join("root.txt"), "root content")?;

        let top = repository.create_layer("top-layer", Some(root))?;
        fs::write(top.path().join("top.txt"), "top content")?;

        let config: ImageConfiguration = serde_json::from_value(serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": { "type": "layers", "diff_ids": [] },
            "history": [{ "created_by": "test fixture" }]
        }))?;
        top.save_config(&config)?;

        anyhow::Ok(top)
    }

    /// Reads every regular file in a tar byte stream into a map.
    pub(crate) fn entries_of(bytes: &[u8]) -> anyhow::Result<HashMap<String, Vec<u8>>> {
        let mut archive = tar::Archive::new(bytes);
        let mut entries = HashMap::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry.path()?.to_string_lossy().into_owned();
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            entries.insert(name, contents);
        }

        anyhow::Ok(entries)
    }

    /// Appends one regular file to a tar builder.
    pub(crate) fn add_file<W: Write>(
        builder: &mut tar::Builder<W>,
        name: &str,
        contents: &[u8],
    ) -> anyhow::Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(contents.len() as u64);
        builder.append_data(&mut header, name, contents)?;
        anyhow::Ok(())
    }

    /// Builds a tar stream containing a single regular file.
    pub(crate) fn tarball_of_one_file(name: &str, contents: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        add_file(&mut builder, name, contents)?;
        anyhow::Ok(builder.into_inner()?)
    }
}
