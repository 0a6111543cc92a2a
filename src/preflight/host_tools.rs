//! Host tool availability checks.

use crate::process;

use super::types::CheckResult;

/// Check host tools the build calls are installed.
pub fn check_host_tools() -> Vec<CheckResult> {
    // depmod failing only costs the module index, so it is not fatal
    [("depmod", "kmod", "Regenerates the module index in the archive")]
        .into_iter()
        .map(|(tool, package, purpose)| check_tool_exists(tool, package, purpose, false))
        .collect()
}

/// Check if a tool exists in PATH.
fn check_tool_exists(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match process::which(tool) {
        Some(path) => CheckResult::pass_with(tool, &path.display().to_string()),
        None => {
            let msg = format!("Not found. Install '{}' package. {}", package, purpose);
            if required {
                CheckResult::fail(tool, &msg)
            } else {
                CheckResult::warn(tool, &msg)
            }
        }
    }
}
