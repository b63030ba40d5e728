//! Shared vocabulary for the cloud query engine workspace.
//!
//! Holds the error taxonomy, dependency lifecycle events, and
//! the cross-cutting data model that every other crate in this
//! workspace depends on, so none of them need to depend on each other just
//! to share a type.

pub mod error;
pub mod events;
pub mod types;

pub use error::{Error, ErrorContext, ErrorKind, ErrorSource, Result};
pub use events::{DependencyEvent, WellKnownDependency};
pub use types::{ColumnSchema, ColumnType, CorsHandling, FileSchema, FormatTag, ProviderTag, QueryResultPayload};
