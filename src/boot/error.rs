//! Error types for the boot resolver.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why the boot stopped short of handing off to the real init.
///
/// Every variant ends in the rescue shell; [`BootFailure::diagnostic`] is
/// what gets printed on the console before it starts.
#[derive(Error, Debug)]
pub enum BootFailure {
    #[error("Failed to mount {fstype} on {}: {source}", .target.display())]
    PseudoFs {
        fstype: &'static str,
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No boot media found ({} device(s) probed)", .attempts.len())]
    NoMedia { attempts: Vec<(PathBuf, String)> },

    #[error("Failed to mount system image {}: {reason}", .image.display())]
    SystemImage { image: PathBuf, reason: String },

    #[error("Failed to set up the root: overlay ({overlay}) and read-only bind ({bind}) both failed")]
    Overlay { overlay: String, bind: String },

    #[error("New root is missing {}", .missing.display())]
    Validation { missing: PathBuf },

    #[error("No init found in the new root (tried {})", .tried.join(", "))]
    NoInit { tried: Vec<String> },

    #[error("Handoff to {} failed: {source}", .init.display())]
    Handoff {
        init: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl BootFailure {
    /// Multi-line console report: the error plus whatever was attempted.
    pub fn diagnostic(&self) -> String {
        let mut out = format!("rookery: boot failed: {}\n", self);
        match self {
            BootFailure::NoMedia { attempts } => {
                if attempts.is_empty() {
                    out.push_str("  no optical or disk-like devices appeared\n");
                }
                for (device, why) in attempts {
                    out.push_str(&format!("  {}: {}\n", device.display(), why));
                }
                out.push_str("  expected a medium with rookery/.live-media and LiveOS/rootfs.img\n");
            }
            BootFailure::SystemImage { .. } => {
                out.push_str("  the boot medium was found but its system image is unusable\n");
            }
            _ => {}
        }
        out.push_str("Dropping to a shell. Exiting it starts a new one.\n");
        out
    }
}
