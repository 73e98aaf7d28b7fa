//! Docker-v1 archive import and export.
//!
//! The archive layout is the one `docker save` emits: per-layer directories
//! named by chain-ID hex holding `layer.tar` and `json`, a `manifest.json`,
//! a `repositories` file, and one `<config>.json` per image. No attempt is
//! made to talk to a daemon; archives come in and go out as streams.

use std::{
    collections::HashMap,
    fs,
    io::{Read, Write},
    path::PathBuf,
    sync::Arc,
};

use oci_spec::image::ImageConfiguration;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::{
    archive,
    codec::{append_bytes, append_dir, append_stream, pipe, Exporter, Importer, PipeReader,
        PipeWriter},
    layer::Layer,
    repository::Repository,
    utils::{self, LAYER_TAR_FILENAME},
    OvermountError, OvermountResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const LAYER_JSON_ENTRY: &str = "json";
const MANIFEST_ENTRY: &str = "manifest.json";
const REPOSITORIES_ENTRY: &str = "repositories";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The Docker-v1 archive codec. Implements both [`Importer`] and
/// [`Exporter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Docker;

/// The per-layer `json` descriptor inside the archive.
#[derive(Debug, Serialize, Deserialize)]
struct LayerJson {
    id: String,

    #[serde(default)]
    parent: Option<String>,

    #[serde(default)]
    config: serde_json::Value,
}

/// One element of the archive's `manifest.json` array.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ManifestEntry {
    config: String,
    repo_tags: Vec<String>,
    layers: Vec<String>,
}

/// Intermediate state collected while walking an extracted archive.
#[derive(Default)]
struct UnpackedArchive {
    configs: Vec<ImageConfiguration>,
    layers: HashMap<String, Arc<Layer>>,
    layer_files: HashMap<String, PathBuf>,
    layer_parents: HashMap<String, String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Docker {
    /// Creates the codec.
    pub fn new() -> Self {
        Self
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Importer for Docker {
    fn import(
        &self,
        repository: &Repository,
        reader: Box<dyn Read + Send>,
    ) -> OvermountResult<Vec<Arc<Layer>>> {
        let tempdir = repository.temp_dir()?;
        scopeguard::defer! {
            let _ = fs::remove_dir_all(&tempdir);
        }

        tracing::info!("extracting docker archive into {}", tempdir.display());
        archive::apply(&tempdir, archive::maybe_decompress(reader)?)?;

        let unpacked = walk_archive(repository, &tempdir)?;
        construct_images(unpacked)
    }
}

impl Exporter for Docker {
    fn export(
        &self,
        repository: &Repository,
        layer: &Arc<Layer>,
        refs: &[String],
    ) -> OvermountResult<PipeReader> {
        if !layer.exists() {
            return Err(OvermountError::InvalidLayer(format!(
                "layer {} does not exist",
                layer.id()
            )));
        }

        let config = layer.config().map_err(|_| {
            OvermountError::ImageCannotBeComposed("missing image configuration".into())
        })?;

        let chain = repository.new_image(Arc::clone(layer)).layers();
        let repository = repository.clone();
        let refs = refs.to_vec();

        Ok(pipe::spawn(move |writer| {
            write_archive(&repository, &chain, &config, &refs, writer)
        }))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Walks an extracted archive, registering a layer for every
/// `<hash>/layer.tar` and collecting image configurations.
fn walk_archive(
    repository: &Repository,
    tempdir: &std::path::Path,
) -> OvermountResult<UnpackedArchive> {
    let mut unpacked = UnpackedArchive::default();

    for entry in WalkDir::new(tempdir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();

        if name == LAYER_TAR_FILENAME {
            let json_path = entry.path().with_file_name(LAYER_JSON_ENTRY);
            let file = fs::File::open(&json_path).map_err(|error| {
                OvermountError::InvalidLayer(format!(
                    "missing layer descriptor {}: {}",
                    json_path.display(),
                    error
                ))
            })?;

            let layer_json: LayerJson = serde_json::from_reader(file).map_err(|error| {
                OvermountError::InvalidLayer(format!(
                    "malformed layer descriptor {}: {}",
                    json_path.display(),
                    error
                ))
            })?;

            // archive-supplied ids feed into path math below
            crate::layer::validate_id(&layer_json.id)?;

            utils::ensure_dir(
                repository.base_dir(),
                repository.layer_path(&layer_json.id),
            )?;
            let layer = match repository.create_layer(&layer_json.id, None) {
                Result::Ok(layer) => layer,
                Err(OvermountError::LayerExists(_)) => repository.open_layer(&layer_json.id)?,
                Err(error) => return Err(error),
            };

            unpacked
                .layer_files
                .insert(layer_json.id.clone(), entry.path().to_path_buf());
            if let Some(parent) = layer_json.parent.filter(|parent| !parent.is_empty()) {
                unpacked.layer_parents.insert(layer_json.id.clone(), parent);
            }
            unpacked.layers.insert(layer_json.id, layer);
        } else if name.ends_with(".json") && name != MANIFEST_ENTRY {
            let contents = fs::read(entry.path())?;
            unpacked.configs.push(serde_json::from_slice(&contents)?);
        }
    }

    Ok(unpacked)
}

/// Attaches parents, unpacks every recorded layer, and persists each image
/// configuration on its top layer.
fn construct_images(unpacked: UnpackedArchive) -> OvermountResult<Vec<Arc<Layer>>> {
    let mut by_digest = HashMap::new();

    for (id, tar_path) in &unpacked.layer_files {
        let layer = &unpacked.layers[id];

        if let Some(parent_id) = unpacked.layer_parents.get(id) {
            let parent = unpacked.layers.get(parent_id).ok_or_else(|| {
                OvermountError::InvalidLayer(format!(
                    "parent {} of layer {} is not in the archive",
                    parent_id, id
                ))
            })?;
            layer.set_parent(Some(Arc::clone(parent)));
        }

        let digest = layer.unpack(fs::File::open(tar_path)?)?;
        layer.save_parent()?;
        by_digest.insert(digest, Arc::clone(layer));
    }

    let mut tops = Vec::new();
    for config in unpacked.configs {
        let last_diff_id = config
            .rootfs()
            .diff_ids()
            .last()
            .map(|diff_id| diff_id.to_string())
            .ok_or_else(|| {
                OvermountError::InvalidLayer("image configuration lists no diff ids".into())
            })?;

        let top = by_digest.get(&last_diff_id).ok_or_else(|| {
            OvermountError::InvalidLayer(format!(
                "top layer {} is not in the archive",
                last_diff_id
            ))
        })?;

        top.save_config(&config)?;
        tops.push(Arc::clone(top));
    }

    Ok(tops)
}

/// Streams the archive for `chain` (ordered top to root) into `writer`,
/// emitting ancestors root-first so chain-IDs accumulate correctly.
fn write_archive(
    repository: &Repository,
    chain: &[Arc<Layer>],
    config: &ImageConfiguration,
    refs: &[String],
    writer: &mut PipeWriter,
) -> OvermountResult<()> {
    let mut builder = tar::Builder::new(writer);

    let mut parent_hex = String::new();
    let mut diff_ids = Vec::new();
    let mut layer_entries = Vec::new();

    for layer in chain.iter().rev() {
        let scratch = repository.temp_dir()?;
        scopeguard::defer! {
            let _ = fs::remove_dir_all(&scratch);
        }

        let tar_path = scratch.join(LAYER_TAR_FILENAME);
        let digest = layer.pack(fs::File::create(&tar_path)?)?;
        let diff_hex = utils::digest_hex(&digest).to_string();
        let chain_hex = utils::chain_id(&parent_hex, &diff_hex);

        append_dir(&mut builder, &format!("{}/", chain_hex), 0o700)?;

        let mut tar_file = fs::File::open(&tar_path)?;
        let size = tar_file.metadata()?.len();
        append_stream(
            &mut builder,
            &format!("{}/{}", chain_hex, LAYER_TAR_FILENAME),
            0o600,
            size,
            &mut tar_file,
        )?;

        let descriptor = serde_json::to_vec(&LayerJson {
            id: chain_hex.clone(),
            parent: Some(parent_hex.clone()),
            config: serde_json::json!({}),
        })?;
        append_bytes(
            &mut builder,
            &format!("{}/{}", chain_hex, LAYER_JSON_ENTRY),
            0o600,
            &descriptor,
        )?;

        diff_ids.push(digest);
        layer_entries.push(format!("{}/{}", chain_hex, LAYER_TAR_FILENAME));
        parent_hex = chain_hex;
    }

    let top_chain = parent_hex;

    append_bytes(&mut builder, REPOSITORIES_ENTRY, 0o600, b"{}")?;

    let manifest = serde_json::to_vec(&vec![ManifestEntry {
        config: format!("{}.json", top_chain),
        repo_tags: refs.to_vec(),
        layers: layer_entries,
    }])?;
    append_bytes(&mut builder, MANIFEST_ENTRY, 0o600, &manifest)?;

    let mut config_value = serde_json::to_value(config)?;
    config_value["rootfs"] = serde_json::json!({ "type": "layers", "diff_ids": diff_ids });
    config_value["history"] = serde_json::json!([]);
    append_bytes(
        &mut builder,
        &format!("{}.json", top_chain),
        0o600,
        &serde_json::to_vec(&config_value)?,
    )?;

    builder.into_inner()?.flush()?;

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
