mod check;
mod cow;
mod node;
mod path;
mod summary;
mod update;

pub use check::{check_store, CheckReport, Severity};
pub use summary::Summary;

pub(crate) use check::check_tree;
pub(crate) use cow::release;
pub(crate) use node::{BranchNode, LeafNode, NodeHeader};
#[cfg(test)]
pub(crate) use node::Node;
pub(crate) use path::{load, Path, PathElement};
pub(crate) use update::{Cursor, Unit, Updater};
