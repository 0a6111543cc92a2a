//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `build` - Compose the boot archive
//! - `preflight` - Run preflight checks
//! - `show` - Display configuration and the manifest
//! - `resolve` - Print the library closure of one binary
//! - `clean` - Remove build outputs

pub mod build;
pub mod clean;
mod preflight;
pub mod resolve;
pub mod show;

pub use build::cmd_build;
pub use clean::cmd_clean;
pub use preflight::cmd_preflight;
pub use resolve::cmd_resolve;
pub use show::cmd_show;
