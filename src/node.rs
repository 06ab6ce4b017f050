//! Metadata nodes and the breadcrumb chain
//!
//! A node describes one remote file or folder. Instead of carrying a full path
//! string, each node points at the node of its parent directory through
//! `previous`, so the chain from the current node down to the root is the
//! breadcrumb. Links only ever point up the tree; no node references a
//! descendant, which keeps the chain acyclic.

use std::fmt;
use std::sync::{Arc, RwLock};

/// Shared handle to a metadata node. Identity is pointer identity.
pub type NodeRef = Arc<MetadataNode>;

/// One remote file or folder
pub struct MetadataNode {
    /// Backend-assigned identity (empty for nodes addressed by path only)
    pub file_id: String,
    pub is_folder: bool,
    /// True if the parent of this node is the drive root
    pub is_under_root: bool,
    /// Name including extension for files
    pub name: String,
    /// Display path on the drive
    pub path: String,
    pub size: Option<u64>,
    /// Last modification time (ISO 8601 string)
    pub modified: Option<String>,
    previous: RwLock<Option<NodeRef>>,
}

impl MetadataNode {
    /// Create a folder node
    pub fn folder(file_id: impl Into<String>, name: impl Into<String>, path: impl Into<String>, is_under_root: bool) -> NodeRef {
        Arc::new(Self {
            file_id: file_id.into(),
            is_folder: true,
            is_under_root,
            name: name.into(),
            path: path.into(),
            size: None,
            modified: None,
            previous: RwLock::new(None),
        })
    }

    /// Create a file node
    pub fn file(
        file_id: impl Into<String>,
        name: impl Into<String>,
        path: impl Into<String>,
        is_under_root: bool,
        size: Option<u64>,
        modified: Option<String>,
    ) -> NodeRef {
        Arc::new(Self {
            file_id: file_id.into(),
            is_folder: false,
            is_under_root,
            name: name.into(),
            path: path.into(),
            size,
            modified,
            previous: RwLock::new(None),
        })
    }

    /// The node one level higher in the tree, if any
    pub fn previous(&self) -> Option<NodeRef> {
        self.previous
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-point `previous`. Callers must ensure `prev` cannot reach `self`.
    pub(crate) fn link_previous(&self, prev: Option<NodeRef>) {
        *self.previous.write().unwrap_or_else(|e| e.into_inner()) = prev;
    }

    /// Walk `previous` links from `self` looking for `target` (by identity)
    pub fn chain_contains(self: &Arc<Self>, target: &NodeRef) -> bool {
        let mut next = Some(Arc::clone(self));
        while let Some(node) = next {
            if Arc::ptr_eq(&node, target) {
                return true;
            }
            next = node.previous();
        }
        false
    }

    /// Unlink every node from `self` up to, but not including, `target`.
    ///
    /// Nodes strictly between the old position and `target` lose their parent
    /// link, so nothing keeps them alive once the caller drops its reference.
    pub fn break_chain_until(self: &Arc<Self>, target: &NodeRef) {
        let mut next = Some(Arc::clone(self));
        while let Some(node) = next {
            if Arc::ptr_eq(&node, target) {
                break;
            }
            next = node.previous();
            node.link_previous(None);
        }
    }

    /// Ancestor chain ordered from the top-most folder down to `self`
    pub fn breadcrumbs(self: &Arc<Self>) -> Vec<NodeRef> {
        let mut chain = Vec::new();
        let mut next = Some(Arc::clone(self));
        while let Some(node) = next {
            next = node.previous();
            chain.push(node);
        }
        chain.reverse();
        chain
    }

    /// Names joined along the breadcrumb, e.g. `/Photos/2016`
    pub fn display_path(self: &Arc<Self>) -> String {
        let names: Vec<String> = self.breadcrumbs().iter().map(|n| n.name.clone()).collect();
        format!("/{}", names.join("/"))
    }
}

impl fmt::Debug for MetadataNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataNode")
            .field("file_id", &self.file_id)
            .field("name", &self.name)
            .field("is_folder", &self.is_folder)
            .field("is_under_root", &self.is_under_root)
            .field("previous", &self.previous().map(|p| p.name.clone()))
            .finish()
    }
}

/// Compute the new current node after a successful listing of `target`.
///
/// - at root, any target is adopted as-is
/// - a `None` target means root: the old chain is released
/// - a target already in the chain is an ancestor jump; the nodes in between
///   are unlinked
/// - otherwise the target is a descendant and gets linked under `current`
pub fn apply_navigation(current: Option<&NodeRef>, target: Option<NodeRef>) -> Option<NodeRef> {
    let (current, target) = match (current, target) {
        (_, None) => return None,
        (None, Some(target)) => return Some(target),
        (Some(current), Some(target)) => (current, target),
    };

    if current.chain_contains(&target) {
        current.break_chain_until(&target);
    } else {
        target.link_previous(Some(Arc::clone(current)));
    }
    Some(target)
}
