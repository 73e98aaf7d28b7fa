//! Utility functions and types.

mod digest;
mod env;
mod path;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use digest::*;
pub use env::*;
pub use path::*;
