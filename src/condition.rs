//! Recognition of known isolate failure messages.

/// A failure condition the driver knows how to recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// `--init` found a box with the same id.
    BoxAlreadyExists,
    /// The existing box was created without `--cg`.
    IncompatibleCgroupMode,
    /// The isolate binary is not running with root privileges.
    RequiresRoot,
    /// The program could not be exec'd, most likely "text file busy".
    TextFileBusy,
}

/// Maps isolate output to a known condition, if any.
pub fn classify(output: &str) -> Option<Condition> {
    let trimmed = output.trim_start();
    if trimmed.starts_with("Box already exists") {
        Some(Condition::BoxAlreadyExists)
    } else if output.contains("incompatible control group mode") {
        Some(Condition::IncompatibleCgroupMode)
    } else if trimmed.starts_with("Must be started as root") {
        Some(Condition::RequiresRoot)
    } else if output.contains("execve") || output.to_ascii_lowercase().contains("text file busy") {
        Some(Condition::TextFileBusy)
    } else {
        None
    }
}
