//! Utility functions for working with environment variables.

use std::path::PathBuf;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable for the repository base directory
pub const OVERMOUNT_REPO_ENV_VAR: &str = "OVERMOUNT_REPO";

/// Environment variable selecting virtual mode (`true`/`false`)
pub const OVERMOUNT_VIRTUAL_ENV_VAR: &str = "OVERMOUNT_VIRTUAL";

/// The directory name for overmount's default repository, under the user's
/// home directory
pub const OVERMOUNT_HOME_DIR: &str = ".overmount";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the repository base directory.
/// If the OVERMOUNT_REPO environment variable is set, returns that path.
/// Otherwise, returns `$HOME/.overmount`.
pub fn get_overmount_repo_path() -> PathBuf {
    if let Result::Ok(repo) = std::env::var(OVERMOUNT_REPO_ENV_VAR) {
        PathBuf::from(repo)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(OVERMOUNT_HOME_DIR)
    }
}

/// Returns whether virtual mode was requested through the environment.
/// Any value other than `0`, `false` or the empty string counts as set.
pub fn get_overmount_virtual() -> bool {
    match std::env::var(OVERMOUNT_VIRTUAL_ENV_VAR) {
        Result::Ok(value) => !matches!(value.as_str(), "" | "0" | "false"),
        Err(_) => false,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
