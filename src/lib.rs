//! minbox - a small driver for the isolate sandbox.
//!
//! Boxes are created by a [`BoxManager`], staged with input files, used to
//! run commands under time, memory and filesystem limits, and finally torn
//! down. All work against one box is serialized by the box's own lock.

#[cfg(not(target_os = "linux"))]
compile_error!("minbox only works on Linux.");

pub mod command;
pub mod condition;
pub mod config;
pub mod error;
pub mod flags;
pub mod http_server;
pub mod manager;
pub mod meta;
pub mod sandbox;
pub mod state;

pub use command::resolve_command;
pub use config::SandboxConfig;
pub use error::{BoxError, Result};
pub use flags::{DirRule, RunConfig};
pub use manager::BoxManager;
pub use meta::{RunResult, RunStatus};
pub use sandbox::BoxHandle;
