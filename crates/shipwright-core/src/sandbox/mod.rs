//! Sandbox runner: executes a [`SourceArtifact`](crate::domain::SourceArtifact)
//! under strict time, memory and CPU limits and reports a structured
//! [`ExecutionResult`].
//!
//! - [`policy`]  `ExecutionPolicy` and `IsolationMode`
//! - [`runtime`] per-language interpreter/image table, `SandboxSettings`
//! - [`runner`]  the `SandboxRunner` trait and `LocalSandbox`
//! - [`result`]  `ExecutionResult` / `ExecutionStatus`
//! - [`error`]   setup errors, folded into `SandboxSetupFailure`

mod capture;
mod container;
pub mod error;
mod limits;
pub mod policy;
mod process;
pub mod result;
pub mod runner;
pub mod runtime;

pub use error::{SandboxError, SandboxResult};
pub use policy::{ExecutionPolicy, IsolationMode};
pub use result::{ExecutionResult, ExecutionStatus};
pub use runner::{runtime_available, LocalSandbox, SandboxRunner};
pub use runtime::{RuntimeSpec, SandboxSettings};
