//! Kernel command line parameters understood by the boot resolver.
//!
//! We know exactly which keys we care about, so parsing is a single pass
//! over whitespace-separated words; everything else is ignored.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SETTLE: Duration = Duration::from_secs(5);
pub const DEFAULT_OVERLAY_SIZE: &str = "50%";

/// Exported to the real init as `ROOKERY_BOOT_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootMode {
    #[default]
    Live,
    Install,
}

impl BootMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BootMode::Live => "live",
            BootMode::Install => "install",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootCmdline {
    pub mode: BootMode,
    pub debug: bool,
    /// Open a shell after validation, before handoff.
    pub emergency: bool,
    /// Device probed before the optical and disk lists.
    pub media: Option<PathBuf>,
    /// Upper bound on waiting for block devices.
    pub settle: Duration,
    /// tmpfs `size=` for the overlay's writable layer.
    pub overlay_size: String,
}

impl Default for BootCmdline {
    fn default() -> Self {
        Self {
            mode: BootMode::default(),
            debug: false,
            emergency: false,
            media: None,
            settle: DEFAULT_SETTLE,
            overlay_size: DEFAULT_OVERLAY_SIZE.to_string(),
        }
    }
}

impl BootCmdline {
    /// Parse `/proc/cmdline`. Later occurrences of a key win.
    pub fn parse(cmdline: &str) -> Self {
        let mut args = Self::default();

        for word in cmdline.split_ascii_whitespace() {
            match word.split_once('=') {
                Some(("rookery.mode", "live")) => args.mode = BootMode::Live,
                Some(("rookery.mode", "install")) => args.mode = BootMode::Install,
                Some(("rookery.mode", other)) => {
                    tracing::warn!("Unknown rookery.mode={}, keeping {}", other, args.mode.as_str())
                }
                Some(("rookery.media", dev)) if !dev.is_empty() => {
                    args.media = Some(if dev.starts_with('/') {
                        PathBuf::from(dev)
                    } else {
                        PathBuf::from("/dev").join(dev)
                    });
                }
                Some(("rookery.settle", secs)) => match secs.parse::<u64>() {
                    Ok(s) => args.settle = Duration::from_secs(s),
                    Err(_) => tracing::warn!("Ignoring rookery.settle={}", secs),
                },
                Some(("rookery.overlay_size", size)) => {
                    // lands inside mount options; no separators allowed
                    if !size.is_empty() && !size.contains(',') {
                        args.overlay_size = size.to_string();
                    } else {
                        tracing::warn!("Ignoring rookery.overlay_size={}", size);
                    }
                }
                Some(_) => {}
                None => match word {
                    "rookery.debug" | "debug" => args.debug = true,
                    "emergency" => args.emergency = true,
                    _ => {}
                },
            }
        }

        args
    }
}
