use std::{
    error::Error,
    fmt::{self, Display},
    path::StripPrefixError,
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an overmount-related operation.
pub type OvermountResult<T> = Result<T, OvermountError>;

/// An error that occurred during a layer store operation.
#[derive(pretty_error_debug::Debug, Error)]
pub enum OvermountError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An asset path is a symlink, not a directory, or otherwise unusable.
    #[error("invalid asset: {0}")]
    InvalidAsset(String),

    /// A parent file is malformed, a referenced parent is missing on disk, or
    /// a layer operation was requested on a non-existent layer.
    #[error("invalid layer: {0}")]
    InvalidLayer(String),

    /// A layer with the same id is already registered.
    #[error("layer exists: {0}")]
    LayerExists(String),

    /// A tag lookup or removal failed.
    #[error("tag does not exist: {0}")]
    TagDoesNotExist(String),

    /// Mount preconditions were not met.
    #[error("mount cannot proceed: {0}")]
    MountCannotProceed(String),

    /// The kernel mount syscall failed.
    #[error("mount failed: {0}")]
    MountFailed(String),

    /// The kernel unmount syscall failed.
    #[error("unmount failed: {0}")]
    UnmountFailed(String),

    /// Archive assembly failed.
    #[error("image cannot be composed: {0}")]
    ImageCannotBeComposed(String),

    /// The parent layer exists but is not mounted. Reserved for per-layer
    /// mount strategies.
    #[error("parent not mounted, cannot continue")]
    ParentNotMounted,

    /// An error that occurred when serializing or deserializing JSON.
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// An error that occurred when building or parsing OCI types.
    #[error("oci spec error: {0}")]
    OciSpec(#[from] oci_spec::OciSpecError),

    /// An error that occurred during a walkdir operation.
    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// An error that occurred when stripping a path prefix.
    #[error("strip prefix error: {0}")]
    StripPrefix(#[from] StripPrefixError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OvermountError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> OvermountError {
        OvermountError::Custom(AnyError {
            error: error.into(),
        })
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `OvermountResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> OvermountResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
