//! End-to-end tests of the layer store through its public API.

use std::{fs, io, sync::Arc};

use overmount::{codec::Docker, utils, Repository};
use tempfile::tempdir;

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test]
fn test_store_unpack_then_repack_is_digest_stable() -> anyhow::Result<()> {
    let temp = tempdir()?;
    let repository = Repository::new(temp.path(), false)?;

    fs::create_dir_all(repository.layer_path("source").join("rootfs"))?;
    let source = repository.create_layer("source", None)?;
    fs::create_dir_all(source.path().join("etc"))?;
    fs::write(source.path().join("etc/hostname"), "overmount-test")?;
    fs::write(source.path().join("some-file"), "some content")?;

    let mut tarball = Vec::new();
    let source_digest = source.pack(&mut tarball)?;

    fs::create_dir_all(repository.layer_path("scratch"))?;
    let layer = repository.create_layer("scratch", None)?;
    let unpack_digest = layer.unpack(tarball.as_slice())?;
    assert_eq!(unpack_digest, source_digest);
    assert_ne!(unpack_digest, utils::EMPTY_DIGEST);

    assert!(layer.path().join("some-file").exists());
    assert!(layer.path().join("etc/hostname").exists());

    // re-packing the materialized tree reproduces the unpacked stream
    let repack_digest = layer.pack(io::sink())?;
    assert_eq!(repack_digest, unpack_digest);
    assert_eq!(layer.digest(), repack_digest);

    Ok(())
}

#[test]
fn test_store_chain_survives_restart() -> anyhow::Result<()> {
    let temp = tempdir()?;

    {
        let repository = Repository::new(temp.path(), false)?;
        let mut parent = None;
        for id in ["base", "app", "config"] {
            fs::create_dir_all(repository.layer_path(id))?;
            let layer = repository.create_layer(id, parent.take())?;
            parent = Some(layer);
        }

        let image = repository.new_image(parent.expect("chain should not be empty"));
        image.commit()?;
        repository.add_tag("myimg", image.layer())?;
    }

    // a fresh process only sees the on-disk state
    let repository = Repository::new(temp.path(), false)?;
    let top = repository.get_tag("myimg")?;
    assert_eq!(top.id(), "config");

    top.restore_parent()?;

    let mut ids = Vec::new();
    let mut current = Some(Arc::clone(&top));
    while let Some(layer) = current {
        ids.push(layer.id().to_string());
        current = layer.parent();
    }
    assert_eq!(ids, ["config", "app", "base"]);

    Ok(())
}

#[test]
fn test_store_docker_archive_survives_repositories() -> anyhow::Result<()> {
    let first_dir = tempdir()?;
    let first = Repository::new(first_dir.path(), false)?;

    fs::create_dir_all(first.layer_path("root").join("rootfs"))?;
    fs::create_dir_all(first.layer_path("top").join("rootfs"))?;

    let root = first.create_layer("root", None)?;
    fs::write(root.path().join("from-root"), "root data")?;
    let top = first.create_layer("top", Some(root))?;
    fs::write(top.path().join("from-top"), "top data")?;

    let config = serde_json::from_value(serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "rootfs": { "type": "layers", "diff_ids": [] },
        "history": []
    }))?;
    top.save_config(&config)?;

    let refs = vec!["survivor:latest".to_string()];
    let reader = first.export(&Docker::new(), &top, &refs)?;

    let second_dir = tempdir()?;
    let second = Repository::new(second_dir.path(), false)?;
    let tops = second.import(&Docker::new(), reader)?;

    assert_eq!(tops.len(), 1);
    let imported = &tops[0];
    assert_eq!(
        fs::read_to_string(imported.path().join("from-top"))?,
        "top data"
    );

    let parent = imported.parent().expect("imported top should have a parent");
    assert_eq!(
        fs::read_to_string(parent.path().join("from-root"))?,
        "root data"
    );

    // the emitted diff-IDs come from the pack digests of the source layers
    let imported_config = imported.config()?;
    assert_eq!(imported_config.rootfs().diff_ids().len(), 2);

    Ok(())
}
