//! Core types for the permission engine
//!
//! - `Identity` - Authenticated caller, as handed over by the session layer
//! - `GuardError` / `ErrorCode` - Error types

pub mod error;
pub mod identity;

pub use error::{ErrorCode, GuardError, GuardResult};
pub use identity::Identity;
