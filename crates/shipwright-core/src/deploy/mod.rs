//! Deployment manager: immutable, versioned deployment directories with an
//! atomically swapped active pointer per name, rollback and deletion.

pub mod error;
pub(crate) mod layout;
pub mod manager;
pub mod record;

pub use error::{DeployError, DeployResult};
pub use layout::LOG_SECTION_MARKER;
pub use manager::DeploymentManager;
pub use record::{DeploymentRecord, DeploymentStatus};
