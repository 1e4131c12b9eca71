//! Access-control evaluation.
//!
//! A node grants or denies access based on six bits split into an owner
//! triple and an everyone-else triple. Which triple applies is decided once
//! per check from the node's owner set: the caller's handle, any of the
//! caller's groups, or a wildcard owner places the caller in the owner
//! group, and the same classification is reused for the parent lookup.
//!
//! The traverse bit on a *parent* acts as an inheritance switch with
//! inverted polarity: when the parent's traverse bit for the caller's group
//! is clear, the parent imposes nothing and the child's own bits decide
//! alone; when it is set, the parent's bit for the requested mode must also
//! grant. The traverse bit of the node itself is never consulted for read
//! or write checks.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{NodeId, OwnerSet, TreeState};

/// Reserved identity handle that bypasses every check. Internal services
/// act under this handle; it is never a valid end-user handle.
pub const SYSTEM_HANDLE: &str = "system";

/// Owner names that match every caller.
const WILDCARD_OWNERS: [&str; 2] = ["public", "guest"];

/// What a caller wants to do with a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Traverse,
}

/// An authenticated caller: a handle plus the groups it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub handle: String,
    pub groups: BTreeSet<String>,
}

impl Identity {
    pub fn new(handle: impl Into<String>, groups: &[&str]) -> Self {
        Self {
            handle: handle.into(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    /// The all-powerful internal identity.
    pub fn system() -> Self {
        Self::new(SYSTEM_HANDLE, &[])
    }

    pub fn is_system(&self) -> bool {
        self.handle == SYSTEM_HANDLE
    }
}

/// Whether `who` falls into the owner group of a node with these owners.
fn is_owner(who: &Identity, owners: &OwnerSet) -> bool {
    if owners.contains(&who.handle) {
        return true;
    }
    if who.groups.iter().any(|g| owners.contains(g)) {
        return true;
    }
    WILDCARD_OWNERS.iter().any(|w| owners.contains(*w))
}

/// Single-node access check.
pub(crate) fn accessible(state: &TreeState, id: NodeId, who: &Identity, mode: AccessMode) -> bool {
    if who.is_system() {
        return true;
    }
    let Some(node) = state.nodes.get(&id) else {
        return false;
    };
    let owner = is_owner(who, &node.owners);
    let own_bit = node.perms.allows(owner, mode);
    let parent_bit = match node.parent.and_then(|p| state.nodes.get(&p)) {
        None => true,
        Some(parent) => {
            if !parent.perms.allows(owner, AccessMode::Traverse) {
                // Inheritance switched off: the parent imposes nothing.
                true
            } else {
                parent.perms.allows(owner, mode)
            }
        }
    };
    own_bit && parent_bit
}

/// Whole-subtree access check, the walk's root included. Gates recursive
/// operations such as subtree download or removal.
pub(crate) fn accessible_all(
    state: &TreeState,
    id: NodeId,
    who: &Identity,
    mode: AccessMode,
) -> bool {
    if who.is_system() {
        return true;
    }
    let mut stack = vec![id];
    while let Some(cur) = stack.pop() {
        if !accessible(state, cur, who, mode) {
            return false;
        }
        if let Some(node) = state.nodes.get(&cur) {
            if let crate::NodeKind::Directory { children } = &node.kind {
                stack.extend(children.values().copied());
            }
        }
    }
    true
}
