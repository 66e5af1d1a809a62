pub mod core;
pub mod config;
pub mod rules;

// Storage and the decision pipeline
pub mod store;
pub mod resolver;
pub mod evaluator;
pub mod locks;

// Administration and the request-facing facade
pub mod admin;
pub mod guard;

pub mod logging;

pub use admin::{GrantRequest, PermissionAdmin};
pub use config::{GuardConfig, RoleCombination, RoleDefaults, StoreConfig};
pub use core::{ErrorCode, GuardError, GuardResult, Identity};
pub use evaluator::{Decision, DenyReason};
pub use guard::PermissionGuard;
pub use resolver::Coordinate;
