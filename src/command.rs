//! Command resolution before running inside a box.

use crate::error::{BoxError, Result};
use crate::sandbox::BOX_DIR;

/// Returns `command` with its program replaced by a concrete host path.
///
/// Programs already addressed inside the box are kept as they are. Anything
/// else is looked up on `PATH` and symlinks are resolved, since toolchains
/// such as java hide their binaries behind several links.
pub fn resolve_command(command: &[String]) -> Result<Vec<String>> {
    let program = command.first().ok_or(BoxError::EmptyCommand)?;
    if program.starts_with(BOX_DIR) {
        return Ok(command.to_vec());
    }

    let found = which::which(program).map_err(|e| BoxError::CommandLookup {
        program: program.clone(),
        reason: e.to_string(),
    })?;
    let resolved = std::fs::canonicalize(&found)?;

    let mut resolved_command = command.to_vec();
    resolved_command[0] = resolved.to_string_lossy().into_owned();
    Ok(resolved_command)
}
