//! Inode table for the FUSE surface.
//!
//! The kernel speaks inodes; the index speaks stable library identifiers.
//! This table hands out inodes lazily and keeps the assignment stable for
//! the lifetime of the mount, so an id keeps its inode across reconciliation
//! passes. Stale inodes simply stop resolving in the index (ENOENT).

use std::collections::HashMap;

use crate::index::{Node, ROOT_FOLDER_ID};

pub const ROOT_INODE: u64 = 1;

pub struct InodeTable {
    by_ino: HashMap<u64, Node>,
    by_node: HashMap<Node, u64>,
    next: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        let root = Node::Folder(ROOT_FOLDER_ID.to_string());
        let mut by_ino = HashMap::new();
        let mut by_node = HashMap::new();
        by_ino.insert(ROOT_INODE, root.clone());
        by_node.insert(root, ROOT_INODE);
        Self {
            by_ino,
            by_node,
            next: 2,
        }
    }

    /// Inode for a node, assigning a fresh one on first sight.
    pub fn ino(&mut self, node: &Node) -> u64 {
        if let Some(&ino) = self.by_node.get(node) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, node.clone());
        self.by_node.insert(node.clone(), ino);
        ino
    }

    pub fn node(&self, ino: u64) -> Option<&Node> {
        self.by_ino.get(&ino)
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_inode_one() {
        let table = InodeTable::new();
        assert_eq!(
            table.node(ROOT_INODE),
            Some(&Node::Folder(ROOT_FOLDER_ID.to_string()))
        );
    }

    #[test]
    fn assignment_is_stable() {
        let mut table = InodeTable::new();
        let a = Node::Asset("A1".to_string());
        let b = Node::Folder("F1".to_string());
        let ia = table.ino(&a);
        let ib = table.ino(&b);
        assert_ne!(ia, ib);
        assert_eq!(table.ino(&a), ia);
        assert_eq!(table.node(ia), Some(&a));
        assert_eq!(table.node(ib), Some(&b));
    }
}
