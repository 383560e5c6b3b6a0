//! Cascade deletes.
//!
//! Deleting a resource that other resources depend on expands into a tree of
//! DELETE operations, one per descendant, all sharing the root operation's id
//! as `cascade_root_id`. [`CascadeTreeBuilder`] discovers the tree,
//! [`CascadeProcessor`] executes it leaves first, and failures roll up into a
//! flat [`CascadeErrors`] list on every ancestor.

pub mod builder;
pub mod criteria;
pub mod errors;
pub mod processor;
pub mod status;

pub use builder::CascadeTreeBuilder;
pub use criteria::{CascadeResource, ChildrenCriterion, ChildrenMap, DuplicatesCleaner};
pub use errors::{CASCADE_ERRORS_KEY, CascadeErrorEntry, CascadeErrors};
pub use processor::{CascadePass, CascadeProcessor};
pub use status::CascadedOperations;
