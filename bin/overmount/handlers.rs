use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use overmount::{
    cli::{ExportKind, ImageSubcommand, LayerSubcommand, OvermountArgs, OvermountSubcommand},
    codec::{Docker, Oci},
    utils, OvermountResult, Repository,
};

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

pub fn run(args: OvermountArgs) -> OvermountResult<()> {
    let repo_dir = args.repo.unwrap_or_else(utils::get_overmount_repo_path);
    let virtual_mode = args.virtual_mode || utils::get_overmount_virtual();
    let repository = Repository::new(&repo_dir, virtual_mode)?;

    match args.subcommand {
        OvermountSubcommand::Layer(LayerSubcommand::Tag { id, tags }) => {
            tag_subcommand(&repository, &id, &tags)
        }
        OvermountSubcommand::Layer(LayerSubcommand::Get { tag }) => {
            get_subcommand(&repository, &tag)
        }
        OvermountSubcommand::Image(ImageSubcommand::Import { archive }) => {
            import_subcommand(&repository, &archive)
        }
        OvermountSubcommand::Image(ImageSubcommand::Export {
            kind,
            output,
            id,
            refs,
        }) => export_subcommand(&repository, kind, output, &id, refs),
        OvermountSubcommand::Image(ImageSubcommand::ListLayers { ids }) => {
            list_layers_subcommand(&repository, &ids)
        }
        OvermountSubcommand::Image(ImageSubcommand::Mount { id }) => {
            mount_subcommand(&repository, &id)
        }
        OvermountSubcommand::Image(ImageSubcommand::Unmount { id }) => {
            unmount_subcommand(&repository, &id)
        }
    }
}

fn tag_subcommand(repository: &Repository, id: &str, tags: &[String]) -> OvermountResult<()> {
    let layer = repository.open_layer(id)?;

    for tag in tags {
        repository.add_tag(tag, &layer)?;
    }

    Ok(())
}

fn get_subcommand(repository: &Repository, tag: &str) -> OvermountResult<()> {
    let layer = repository.get_tag(tag)?;
    println!("{}", layer.id());

    Ok(())
}

fn import_subcommand(repository: &Repository, archive: &Path) -> OvermountResult<()> {
    let reader: Box<dyn Read + Send> = if archive == Path::new("-") {
        Box::new(io::stdin())
    } else {
        Box::new(fs::File::open(archive)?)
    };

    for layer in repository.import(&Docker::new(), reader)? {
        println!("{}", layer.id());
    }

    Ok(())
}

fn export_subcommand(
    repository: &Repository,
    kind: ExportKind,
    output: Option<PathBuf>,
    id: &str,
    refs: Vec<String>,
) -> OvermountResult<()> {
    let layer = repository.open_layer(id)?;
    layer.restore_parent()?;

    let mut reader = match kind {
        ExportKind::Docker => repository.export(&Docker::new(), &layer, &refs)?,
        ExportKind::Oci => repository.export(&Oci::new(), &layer, &refs)?,
    };

    let mut writer: Box<dyn Write> = match output {
        Some(path) => Box::new(fs::File::create(path)?),
        None => Box::new(io::stdout()),
    };

    io::copy(&mut reader, &mut writer)?;
    writer.flush()?;

    Ok(())
}

fn list_layers_subcommand(repository: &Repository, ids: &[String]) -> OvermountResult<()> {
    for id in ids {
        let layer = repository.open_layer(id)?;
        layer.restore_parent()?;

        let mut depth = 0;
        let mut current = Some(layer);
        while let Some(layer) = current {
            println!("(depth {}): {}", depth, layer.id());
            depth += 1;
            current = layer.parent();
        }
    }

    Ok(())
}

fn mount_subcommand(repository: &Repository, id: &str) -> OvermountResult<()> {
    let layer = repository.open_layer(id)?;
    layer.restore_parent()?;

    let image = repository.new_image(layer);
    let target = image.mount()?;
    println!("{}", target.display());

    Ok(())
}

fn unmount_subcommand(repository: &Repository, id: &str) -> OvermountResult<()> {
    let layer = repository.open_layer(id)?;

    // The workdir of the process that mounted this image lives under its own
    // tmp allocation and cannot be recovered here; close with a fresh scratch
    // dir, which unmounts the target and removes that scratch dir.
    let mount = repository.new_mount(layer.mount_path(), String::new(), layer.path())?;
    let result = mount.close();
    repository.remove_mount(&mount)?;

    result
}
