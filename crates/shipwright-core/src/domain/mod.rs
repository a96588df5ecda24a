//! Domain models shared by every subsystem.
//!
//! - `SourceArtifact` / `Language`: immutable generated code
//! - `ShipwrightError`: umbrella error taxonomy

pub mod artifact;
pub mod error;

pub use artifact::{normalize_content, Language, SourceArtifact};
pub use error::{Result, ShipwrightError};
