//! OCI image-layout export.
//!
//! Emits a tar conforming to the OCI image layout: an `oci-layout` marker, an
//! `index.json`, and a `blobs/sha256/` tree holding one blob per layer tar,
//! one for the image configuration, and one for the manifest. Tag refs land
//! in the `org.opencontainers.image.ref.name` annotation on the manifest
//! descriptor.

use std::{
    collections::{HashMap, HashSet},
    fs,
    io::Write,
    str::FromStr,
    sync::Arc,
};

use oci_spec::image::{
    Descriptor, DescriptorBuilder, ImageConfiguration, ImageIndexBuilder, ImageManifestBuilder,
    MediaType, OciLayoutBuilder, Sha256Digest,
};

use crate::{
    codec::{append_bytes, append_dir, append_stream, pipe, Exporter, PipeReader, PipeWriter},
    layer::Layer,
    repository::Repository,
    utils,
    OvermountError, OvermountResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const OCI_LAYOUT_ENTRY: &str = "oci-layout";
const OCI_LAYOUT_VERSION: &str = "1.0.0";
const INDEX_ENTRY: &str = "index.json";
const BLOBS_PREFIX: &str = "blobs/sha256";
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The OCI image-layout codec. Export only.
#[derive(Debug, Clone, Copy, Default)]
pub struct Oci;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Oci {
    /// Creates the codec.
    pub fn new() -> Self {
        Self
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Exporter for Oci {
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
            write_layout(&repository, &chain, &config, &refs, writer)
        }))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Streams the image layout for `chain` (ordered top to root) into `writer`.
fn write_layout(
    repository: &Repository,
    chain: &[Arc<Layer>],
    config: &ImageConfiguration,
    refs: &[String],
    writer: &mut PipeWriter,
) -> OvermountResult<()> {
    let scratch = repository.temp_dir()?;
    scopeguard::defer! {
        let _ = fs::remove_dir_all(&scratch);
    }

    // pack every layer up front; blobs are named by their pack digest
    let mut layer_blobs = Vec::new();
    let mut diff_ids = Vec::new();
    for (index, layer) in chain.iter().rev().enumerate() {
        let tar_path = scratch.join(format!("layer-{}.tar", index));
        let digest = layer.pack(fs::File::create(&tar_path)?)?;
        let size = fs::metadata(&tar_path)?.len();

        diff_ids.push(digest.clone());
        layer_blobs.push((utils::digest_hex(&digest).to_string(), tar_path, size));
    }

    let mut config_value = serde_json::to_value(config)?;
    config_value["rootfs"] = serde_json::json!({ "type": "layers", "diff_ids": diff_ids });
    config_value["history"] = serde_json::json!([]);
    let config_bytes = serde_json::to_vec(&config_value)?;
    let config_hex = utils::sha256_hex(&config_bytes);

    let config_descriptor = blob_descriptor(
        MediaType::ImageConfig,
        &config_hex,
        config_bytes.len() as u64,
        None,
    )?;
    let layer_descriptors = layer_blobs
        .iter()
        .map(|(hex, _, size)| blob_descriptor(MediaType::ImageLayer, hex, *size, None))
        .collect::<OvermountResult<Vec<_>>>()?;

    let manifest = ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageManifest)
        .config(config_descriptor)
        .layers(layer_descriptors)
        .build()?;
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let manifest_hex = utils::sha256_hex(&manifest_bytes);

    let manifest_descriptors = if refs.is_empty() {
        vec![blob_descriptor(
            MediaType::ImageManifest,
            &manifest_hex,
            manifest_bytes.len() as u64,
            None,
        )?]
    } else {
        refs.iter()
            .map(|reference| {
                blob_descriptor(
                    MediaType::ImageManifest,
                    &manifest_hex,
                    manifest_bytes.len() as u64,
                    Some(reference),
                )
            })
            .collect::<OvermountResult<Vec<_>>>()?
    };

    let index = ImageIndexBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageIndex)
        .manifests(manifest_descriptors)
        .build()?;
    let index_bytes = serde_json::to_vec(&index)?;

    let layout = OciLayoutBuilder::default()
        .image_layout_version(OCI_LAYOUT_VERSION.to_string())
        .build()?;
    let layout_bytes = serde_json::to_vec(&layout)?;

    let mut builder = tar::Builder::new(writer);

    append_bytes(&mut builder, OCI_LAYOUT_ENTRY, 0o644, &layout_bytes)?;
    append_bytes(&mut builder, INDEX_ENTRY, 0o644, &index_bytes)?;
    append_dir(&mut builder, "blobs/", 0o755)?;
    append_dir(&mut builder, "blobs/sha256/", 0o755)?;

    let mut emitted = HashSet::new();
    for (hex, tar_path, size) in &layer_blobs {
        if !emitted.insert(hex.clone()) {
            // identical layers share one blob
            continue;
        }

        let mut file = fs::File::open(tar_path)?;
        append_stream(
            &mut builder,
            &format!("{}/{}", BLOBS_PREFIX, hex),
            0o644,
            *size,
            &mut file,
        )?;
    }

    append_bytes(
        &mut builder,
        &format!("{}/{}", BLOBS_PREFIX, config_hex),
        0o644,
        &config_bytes,
    )?;
    append_bytes(
        &mut builder,
        &format!("{}/{}", BLOBS_PREFIX, manifest_hex),
        0o644,
        &manifest_bytes,
    )?;

    builder.into_inner()?.flush()?;

    Ok(())
}

fn blob_descriptor(
    media_type: MediaType,
    hex: &str,
    size: u64,
    reference: Option<&str>,
) -> OvermountResult<Descriptor> {
    let digest = Sha256Digest::from_str(hex).map_err(OvermountError::custom)?;

    let descriptor = match reference {
        Some(reference) => DescriptorBuilder::default()
            .media_type(media_type)
            .digest(digest)
            .size(size)
            .annotations(HashMap::from([(
                REF_NAME_ANNOTATION.to_string(),
                reference.to_string(),
            )]))
            .build()?,
        None => DescriptorBuilder::default()
            .media_type(media_type)
            .digest(digest)
            .size(size)
            .build()?,
    };

    Ok(descriptor)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Read;

    use oci_spec::image::{ImageIndex, ImageManifest};
    use tempfile::tempdir;

    use crate::codec::testing as helper;

    use super::*;

    #[test]
    fn test_oci_export_layout() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), false)?;
        let top = helper::populate_repository(&repository)?;

        let refs = vec!["oci".to_string()];
        let mut reader = repository.export(&Oci::new(), &top, &refs)?;
        let mut archive = Vec::new();
        reader.read_to_end(&mut archive)?;

        let entries = helper::entries_of(&archive)?;

        let layout: serde_json::Value = serde_json::from_slice(&entries[OCI_LAYOUT_ENTRY])?;
        assert_eq!(layout["imageLayoutVersion"], "1.0.0");

        let index: ImageIndex = serde_json::from_slice(&entries[INDEX_ENTRY])?;
        assert_eq!(index.manifests().len(), 1);
        let descriptor = &index.manifests()[0];
        assert_eq!(
            descriptor
                .annotations()
                .as_ref()
                .and_then(|annotations| annotations.get(REF_NAME_ANNOTATION)),
            Some(&"oci".to_string())
        );

        // the manifest blob exists under its own digest and lists each layer
        // blob by its pack digest
        let manifest_name = format!(
            "{}/{}",
            BLOBS_PREFIX,
            utils::digest_hex(&descriptor.digest().to_string())
        );
        let manifest: ImageManifest = serde_json::from_slice(&entries[&manifest_name])?;
        assert_eq!(manifest.layers().len(), 2);

        for layer_descriptor in manifest.layers() {
            let blob_name = format!(
                "{}/{}",
                BLOBS_PREFIX,
                utils::digest_hex(&layer_descriptor.digest().to_string())
            );
            let blob = &entries[&blob_name];
            assert_eq!(
                utils::to_digest(&utils::sha256_hex(blob)),
                layer_descriptor.digest().to_string()
            );
        }

        // the config blob carries the rewritten diff-IDs
        let config_name = format!(
            "{}/{}",
            BLOBS_PREFIX,
            utils::digest_hex(&manifest.config().digest().to_string())
        );
        let config: serde_json::Value = serde_json::from_slice(&entries[&config_name])?;
        assert_eq!(
            config["rootfs"]["diff_ids"].as_array().map(Vec::len),
            Some(2)
        );
        assert_eq!(config["history"], serde_json::json!([]));

        Ok(())
    }

    #[test]
    fn test_oci_export_requires_config() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), false)?;

        std::fs::create_dir_all(repository.layer_path("bare"))?;
        let layer = repository.create_layer("bare", None)?;

        assert!(matches!(
            repository.export(&Oci::new(), &layer, &[]),
            Err(OvermountError::ImageCannotBeComposed(_))
        ));

        Ok(())
    }
}
