//! In-memory scene hierarchy.
//!
//! This is the engine's view of "the renderer": a tree of named nodes with
//! an active flag and a local pose. Addresses are `/`-joined node names
//! relative to the root, so `Model/PageA` is the child `PageA` of the
//! root's child `Model`. Sibling names are unique, which keeps every
//! address stable for the lifetime of its node.

use crate::pose::Pose;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use thiserror::Error;

/// Separator between node names in an address.
pub const ADDRESS_SEPARATOR: char = '/';

/// Scene graph errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SceneError {
    #[error("Invalid node name: {0:?}")]
    InvalidName(String),

    #[error("Duplicate node name {name:?} under {parent:?}")]
    DuplicateName { parent: String, name: String },

    #[error("Unknown node: {0:?}")]
    UnknownNode(NodeKey),

    #[error("Unknown address: {0}")]
    UnknownAddress(String),
}

/// Handle to a node in a [`SceneGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey(pub u64);

/// One node of the hierarchy.
#[derive(Debug, Clone)]
pub struct SceneNode {
    pub name: String,
    pub parent: Option<NodeKey>,
    pub children: Vec<NodeKey>,
    /// The node's own flag, not whether it is visible through its ancestors
    pub active: bool,
    pub pose: Pose,
}

/// Splits an address into its node names, ignoring empty segments.
pub fn address_segments(address: &str) -> impl Iterator<Item = &str> {
    address.split(ADDRESS_SEPARATOR).filter(|s| !s.is_empty())
}

/// The one spelling of `address` used as a key: no leading, trailing or
/// doubled separators. `/Model/`, `Model//` and `Model` are all `Model`.
pub fn canonical_address(address: &str) -> Cow<'_, str> {
    let sep = ADDRESS_SEPARATOR;
    if address.starts_with(sep) || address.ends_with(sep) || address.contains("//") {
        Cow::Owned(address_segments(address).collect::<Vec<_>>().join("/"))
    } else {
        Cow::Borrowed(address)
    }
}

/// Joins a parent address and a child name.
pub fn join_address(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}{ADDRESS_SEPARATOR}{name}")
    }
}

/// The scene tree.
#[derive(Debug)]
pub struct SceneGraph {
    nodes: HashMap<NodeKey, SceneNode>,
    root: NodeKey,
    next_key: u64,
}

impl SceneGraph {
    /// Creates a graph holding only its root.
    pub fn new(root_name: &str) -> Self {
        let root = NodeKey(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            SceneNode {
                name: root_name.to_string(),
                parent: None,
                children: Vec::new(),
                active: true,
                pose: Pose::default(),
            },
        );
        Self {
            nodes,
            root,
            next_key: 1,
        }
    }

    pub fn root(&self) -> NodeKey {
        self.root
    }

    pub fn node(&self, key: NodeKey) -> Option<&SceneNode> {
        self.nodes.get(&key)
    }

    fn node_mut(&mut self, key: NodeKey) -> Result<&mut SceneNode, SceneError> {
        self.nodes.get_mut(&key).ok_or(SceneError::UnknownNode(key))
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn child_named(&self, parent: NodeKey, name: &str) -> Option<NodeKey> {
        self.nodes.get(&parent)?.children.iter().copied().find(|child| {
            self.nodes
                .get(child)
                .is_some_and(|node| node.name == name)
        })
    }

    /// Adds an active, identity-posed child.
    pub fn add_child(&mut self, parent: NodeKey, name: &str) -> Result<NodeKey, SceneError> {
        if name.is_empty() || name.contains(ADDRESS_SEPARATOR) {
            return Err(SceneError::InvalidName(name.to_string()));
        }
        if !self.nodes.contains_key(&parent) {
            return Err(SceneError::UnknownNode(parent));
        }
        if self.child_named(parent, name).is_some() {
            return Err(SceneError::DuplicateName {
                parent: self.address_of(parent).unwrap_or_default(),
                name: name.to_string(),
            });
        }

        let key = NodeKey(self.next_key);
        self.next_key += 1;
        self.nodes.insert(
            key,
            SceneNode {
                name: name.to_string(),
                parent: Some(parent),
                children: Vec::new(),
                active: true,
                pose: Pose::default(),
            },
        );
        self.node_mut(parent)?.children.push(key);
        Ok(key)
    }

    /// Returns the node at `address`, creating any missing nodes on the way.
    pub fn ensure_path(&mut self, address: &str) -> Result<NodeKey, SceneError> {
        let mut current = self.root;
        for name in address_segments(address) {
            current = match self.child_named(current, name) {
                Some(child) => child,
                None => self.add_child(current, name)?,
            };
        }
        Ok(current)
    }

    /// Looks up a node by root-relative address. The empty address is the root.
    pub fn find(&self, address: &str) -> Option<NodeKey> {
        let mut current = self.root;
        for name in address_segments(address) {
            current = self.child_named(current, name)?;
        }
        Some(current)
    }

    /// Root-relative address of `key`; the root itself has the empty address.
    pub fn address_of(&self, key: NodeKey) -> Option<String> {
        let mut names = Vec::new();
        let mut current = self.nodes.get(&key)?;
        while let Some(parent) = current.parent {
            names.push(current.name.as_str());
            current = self.nodes.get(&parent)?;
        }
        names.reverse();
        Some(names.join("/"))
    }

    pub fn parent(&self, key: NodeKey) -> Option<NodeKey> {
        self.nodes.get(&key)?.parent
    }

    /// `key` and everything below it, depth first, parents before children.
    pub fn descendants(&self, key: NodeKey) -> Vec<NodeKey> {
        let mut out = Vec::new();
        let mut stack = vec![key];
        while let Some(next) = stack.pop() {
            let Some(node) = self.nodes.get(&next) else {
                continue;
            };
            out.push(next);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    pub fn is_active(&self, key: NodeKey) -> Option<bool> {
        self.nodes.get(&key).map(|node| node.active)
    }

    pub fn set_active(&mut self, key: NodeKey, active: bool) -> Result<(), SceneError> {
        self.node_mut(key)?.active = active;
        Ok(())
    }

    pub fn pose(&self, key: NodeKey) -> Option<Pose> {
        self.nodes.get(&key).map(|node| node.pose)
    }

    pub fn set_pose(&mut self, key: NodeKey, pose: Pose) -> Result<(), SceneError> {
        self.node_mut(key)?.pose = pose;
        Ok(())
    }

    /// Drops every node except the root.
    pub fn clear(&mut self) {
        let root = self.root;
        self.nodes.retain(|key, _| *key == root);
        if let Some(node) = self.nodes.get_mut(&root) {
            node.children.clear();
        }
    }
}

impl Default for SceneGraph {
    fn default() -> Self {
        Self::new("Scene")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn test_addresses_round_trip() {
        let mut graph = SceneGraph::default();
        let page = graph.ensure_path("Model/PageA").unwrap();
        let mesh = graph.add_child(page, "Mesh").unwrap();

        assert_eq!(graph.address_of(graph.root()).unwrap(), "");
        assert_eq!(graph.address_of(page).unwrap(), "Model/PageA");
        assert_eq!(graph.address_of(mesh).unwrap(), "Model/PageA/Mesh");
        assert_eq!(graph.find("Model/PageA/Mesh"), Some(mesh));
        assert_eq!(graph.find("Model/pagea"), None);
        assert_eq!(graph.find(""), Some(graph.root()));
    }

    #[test]
    fn test_sibling_names_are_unique() {
        let mut graph = SceneGraph::default();
        let root = graph.root();
        graph.add_child(root, "Model").unwrap();
        assert!(matches!(
            graph.add_child(root, "Model"),
            Err(SceneError::DuplicateName { .. })
        ));
        assert!(matches!(
            graph.add_child(root, "a/b"),
            Err(SceneError::InvalidName(_))
        ));
        assert!(matches!(
            graph.add_child(NodeKey(999), "x"),
            Err(SceneError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_descendants_are_preorder() {
        let mut graph = SceneGraph::default();
        let a = graph.ensure_path("A").unwrap();
        let b = graph.ensure_path("A/B").unwrap();
        let c = graph.ensure_path("A/C").unwrap();
        let d = graph.ensure_path("A/B/D").unwrap();

        assert_eq!(graph.descendants(a), vec![a, b, d, c]);
    }

    #[test]
    fn test_clear_keeps_root() {
        let mut graph = SceneGraph::default();
        let a = graph.ensure_path("A/B/C").unwrap();
        graph.set_pose(a, Pose::at(Vector3::new(1.0, 0.0, 0.0))).unwrap();

        graph.clear();
        assert!(graph.is_empty());
        assert_eq!(graph.find("A"), None);
    }

    #[test]
    fn test_address_helpers() {
        assert_eq!(canonical_address("Model"), "Model");
        assert_eq!(canonical_address("/Model/"), "Model");
        assert_eq!(canonical_address("Model//Part"), "Model/Part");
        assert_eq!(canonical_address("/"), "");
        assert!(matches!(canonical_address("A/B"), Cow::Borrowed(_)));
        assert_eq!(join_address("", "A"), "A");
        assert_eq!(join_address("A", "B"), "A/B");
        assert_eq!(address_segments("/A//B/").collect::<Vec<_>>(), vec!["A", "B"]);
    }
}
