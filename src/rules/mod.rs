//! Permission rule model
//!
//! A rule grants an [`Actor`] an [`AccessLevel`] on one scoped [`Resource`]
//! inside a base:
//!
//! | Scope    | Resource shape          | Levels                                   |
//! |----------|-------------------------|------------------------------------------|
//! | `table`  | `table`                 | `full`, `read_write`, `read_only`, `no_access` |
//! | `column` | `table`, `column`       | `visible`, `hidden`, `readonly`          |
//! | `row`    | `table`, `row`          | `full`, `add_only`, `read_only`, `hidden` |
//! | `cell`   | `table`, `row`, `column`| `readonly`, `hidden`, `editable`         |
//!
//! ## Example
//!
//! ```rust,ignore
//! use gridguard::rules::{AccessLevel, Actor, CellAccess, PermissionRule, Resource};
//!
//! let rule = PermissionRule::new(
//!     Actor::user("u-42"),
//!     "base-1",
//!     Resource::cell("orders", "row-7", "price"),
//!     AccessLevel::Cell(CellAccess::Readonly),
//! )?;
//! ```

mod resource;
mod rule;
mod types;

pub use resource::{
    validate_shape, AccessLevel, CellAccess, ColumnAccess, Resource, RowAccess, Scope,
    TableAccess,
};
pub use rule::{LockAction, LockEntry, PermissionRule, RuleId, RuleKey, RuleKind};
pub use types::{Action, ActionSet, Actor, Role};
