//! Core domain model and contracts for sift.

pub mod decompose;
pub mod duplicates;
pub mod error;
pub mod model;
pub mod protocol;
pub mod util;

pub use error::{
    DispatchError, IngestError, StoreError, SyncError, TriageError, TriageResult, ValidationError,
};
pub use model::*;
pub use protocol::*;
