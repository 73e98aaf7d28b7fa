use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::{cli::styles, utils::OVERMOUNT_REPO_ENV_VAR};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// overmount is a tool for storing container image layers and composing them
/// into overlay mounts
#[derive(Debug, Parser)]
#[command(name = "overmount", author, version, styles = styles::styles())]
pub struct OvermountArgs {
    /// The repository to use
    #[arg(short, long, env = OVERMOUNT_REPO_ENV_VAR, global = true)]
    pub repo: Option<PathBuf>,

    /// Store layers as tarballs instead of unpacked trees (disables mounting)
    #[arg(long = "virtual", global = true)]
    pub virtual_mode: bool,

    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: OvermountSubcommand,
}

/// Available subcommands for working with a repository
#[derive(Debug, Parser)]
pub enum OvermountSubcommand {
    /// Perform commands on layers
    #[command(subcommand)]
    Layer(LayerSubcommand),

    /// Perform commands on images
    #[command(subcommand)]
    Image(ImageSubcommand),
}

/// Subcommands for working with single layers
#[derive(Debug, Parser)]
pub enum LayerSubcommand {
    /// Record one or more tags for a layer id
    #[command(name = "tag")]
    Tag {
        /// The layer id to tag
        id: String,

        /// Tags to record
        #[arg(required = true)]
        tags: Vec<String>,
    },

    /// Resolve a tag to its layer id
    #[command(name = "get")]
    Get {
        /// The tag to resolve
        tag: String,
    },
}

/// Subcommands for working with whole images
#[derive(Debug, Parser)]
pub enum ImageSubcommand {
    /// Import a docker archive into the repository
    #[command(name = "import")]
    Import {
        /// The archive file to read, or `-` for standard input
        archive: PathBuf,
    },

    /// Export an image and its layer chain as an archive
    #[command(name = "export")]
    Export {
        /// The archive format to emit
        #[arg(long = "type", value_enum, default_value = "docker")]
        kind: ExportKind,

        /// Write the archive here instead of standard output
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// The id of the image's top layer
        id: String,

        /// Refs recorded in the exported archive
        refs: Vec<String>,
    },

    /// List the layer ids of an image chain
    #[command(name = "list-layers")]
    ListLayers {
        /// Top layer ids to walk
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Compose an image chain into an overlay mount
    #[command(name = "mount")]
    Mount {
        /// The id of the image's top layer
        id: String,
    },

    /// Tear down an image's overlay mount
    #[command(name = "unmount")]
    Unmount {
        /// The id of the image's top layer
        id: String,
    },
}

/// Supported export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportKind {
    /// The docker-v1 archive format
    Docker,

    /// The OCI image-layout format
    Oci,
}
