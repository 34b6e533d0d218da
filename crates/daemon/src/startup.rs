//! Startup checks
//!
//! Verifies that the external tools the daemon drives are runnable before
//! anything is claimed:
//! - `ffmpeg -version`
//! - `ffprobe -version`

use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("Could not parse {tool} version from: {line}")]
    UnparsableVersion { tool: String, line: String },
}

/// Version reported by one of the FFmpeg tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersion {
    /// Raw version token, e.g. `7.1.2` or `n8.0-5-g1234567`.
    pub raw: String,
    pub major: u32,
}

/// Extracts the version from `<tool> -version` output.
///
/// Handles plain (`7.1.2`) and `n`-prefixed git builds (`n8.0-5-g1234567`).
pub fn parse_tool_version(tool: &str, output: &str) -> Option<ToolVersion> {
    let marker = format!("{} version", tool.to_lowercase());
    let line = output
        .lines()
        .map(str::to_lowercase)
        .find(|line| line.contains(&marker))?;

    let raw = line.split(&marker).nth(1)?.split_whitespace().next()?.to_string();
    let major = raw
        .trim_start_matches('n')
        .split(['.', '-'])
        .next()?
        .parse()
        .ok()?;

    Some(ToolVersion { raw, major })
}

/// Runs `<binary> -version` and parses the answer.
pub fn check_tool(binary: &str, tool: &str) -> Result<ToolVersion, StartupError> {
    let output = Command::new(binary)
        .arg("-version")
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: tool.to_string(),
            reason: format!("{} -version failed; is it installed and in PATH? Error: {}", binary, e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: tool.to_string(),
            reason: format!("{} -version exited with {}", binary, output.status),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_tool_version(tool, &stdout).ok_or_else(|| StartupError::UnparsableVersion {
        tool: tool.to_string(),
        line: stdout.lines().next().unwrap_or("(empty)").to_string(),
    })
}

/// Run all startup checks in order: ffmpeg, then ffprobe.
pub fn run_startup_checks() -> Result<(), StartupError> {
    for tool in ["ffmpeg", "ffprobe"] {
        let version = check_tool(tool, tool)?;
        info!(tool, version = %version.raw, major = version.major, "Found tool");
    }
    Ok(())
}
