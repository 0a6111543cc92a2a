//! rookiso library exports.
//!
//! The `rookiso` build CLI and the `rookiso-init` boot resolver share this
//! crate; integration tests drive both halves through it.

pub mod archive;
pub mod boot;
pub mod cache;
pub mod compose;
pub mod config;
pub mod cpio;
pub mod elf;
pub mod manifest;
pub mod modules;
pub mod preflight;
pub mod process;
pub mod resolve;
pub mod staging;
pub mod timing;
