//! Attribute tree: hierarchical paths mapped to dense quarks.

use crate::error::{Result, StateError};
use crate::types::Quark;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Separator used when a path is rendered as one string.
pub const PATH_SEPARATOR: char = '/';

/// One attribute node.
#[derive(Clone, Debug)]
struct Node {
    name: String,
    parent: Option<Quark>,
    children: Vec<Quark>,
    by_name: HashMap<String, Quark>,
}

/// Children of the implicit root.
#[derive(Default)]
struct Inner {
    nodes: Vec<Node>,
    roots: Vec<Quark>,
    roots_by_name: HashMap<String, Quark>,
}

impl Inner {
    fn node(&self, quark: Quark) -> Result<&Node> {
        self.nodes
            .get(quark.index())
            .ok_or(StateError::InvalidQuark(quark))
    }

    fn child(&self, parent: Option<Quark>, name: &str) -> Result<Option<Quark>> {
        Ok(match parent {
            None => self.roots_by_name.get(name).copied(),
            Some(q) => self.node(q)?.by_name.get(name).copied(),
        })
    }

    fn children_of(&self, parent: Option<Quark>) -> Result<&[Quark]> {
        Ok(match parent {
            None => &self.roots,
            Some(q) => &self.node(q)?.children,
        })
    }

    fn add_child(&mut self, parent: Option<Quark>, name: &str) -> Result<Quark> {
        if self.nodes.len() >= Quark::INVALID.index() {
            return Err(StateError::InvalidOperation(
                "attribute tree is full".to_string(),
            ));
        }
        let quark = Quark::from_index(self.nodes.len());
        self.nodes.push(Node {
            name: name.to_string(),
            parent,
            children: Vec::new(),
            by_name: HashMap::new(),
        });
        match parent {
            None => {
                self.roots.push(quark);
                self.roots_by_name.insert(name.to_string(), quark);
            }
            Some(p) => {
                let node = self
                    .nodes
                    .get_mut(p.index())
                    .ok_or(StateError::InvalidQuark(p))?;
                node.children.push(quark);
                node.by_name.insert(name.to_string(), quark);
            }
        }
        Ok(quark)
    }
}

/// On-disk form of one node. Parents always precede their children.
#[derive(Serialize, Deserialize)]
struct SerializedNode {
    parent: Option<Quark>,
    name: String,
}

/// Append-only mapping from attribute paths to quarks.
///
/// Written by the single pipeline worker, read by any number of query
/// threads. Quarks are assigned densely in creation order and are never
/// reused or renamed.
pub struct AttributeTree {
    inner: RwLock<Inner>,
}

impl AttributeTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Resolve `path` under `base` (`None` = root), creating missing nodes.
    pub fn get_or_create_quark<S: AsRef<str>>(&self, base: Option<Quark>, path: &[S]) -> Result<Quark> {
        if let Some(quark) = self.lookup_quark(base, path)? {
            return Ok(quark);
        }

        let mut inner = self.inner.write();
        if let Some(b) = base {
            inner.node(b)?;
        }
        let mut current = base;
        for segment in path {
            let segment = segment.as_ref();
            current = Some(match inner.child(current, segment)? {
                Some(existing) => existing,
                None => inner.add_child(current, segment)?,
            });
        }
        current.ok_or_else(|| StateError::InvalidOperation("empty attribute path".to_string()))
    }

    /// Resolve `path` under `base` without creating anything.
    ///
    /// An empty path resolves to `base` itself. Fails only when `base` is not
    /// a quark of this tree.
    pub fn lookup_quark<S: AsRef<str>>(&self, base: Option<Quark>, path: &[S]) -> Result<Option<Quark>> {
        let inner = self.inner.read();
        if let Some(b) = base {
            inner.node(b)?;
        }
        let mut current = base;
        for segment in path {
            match inner.child(current, segment.as_ref())? {
                Some(q) => current = Some(q),
                None => return Ok(None),
            }
        }
        Ok(current)
    }

    /// Direct or transitive children of `quark` (`None` = root), in creation
    /// order. Recursive listing is depth-first, parents before children.
    pub fn children(&self, quark: Option<Quark>, recursive: bool) -> Result<Vec<Quark>> {
        let inner = self.inner.read();
        let direct = inner.children_of(quark)?;
        if !recursive {
            return Ok(direct.to_vec());
        }

        let mut result = Vec::new();
        let mut stack: Vec<Quark> = direct.iter().rev().copied().collect();
        while let Some(q) = stack.pop() {
            result.push(q);
            stack.extend(inner.node(q)?.children.iter().rev().copied());
        }
        Ok(result)
    }

    /// Path segments from the root down to `quark`.
    pub fn path_of(&self, quark: Quark) -> Result<Vec<String>> {
        let inner = self.inner.read();
        let mut path = Vec::new();
        let mut current = Some(quark);
        while let Some(q) = current {
            let node = inner.node(q)?;
            path.push(node.name.clone());
            current = node.parent;
        }
        path.reverse();
        Ok(path)
    }

    /// Path of `quark` joined with `/`.
    pub fn full_path(&self, quark: Quark) -> Result<String> {
        let path = self.path_of(quark)?;
        Ok(path.join(&PATH_SEPARATOR.to_string()))
    }

    /// Last segment of the path of `quark`.
    pub fn name_of(&self, quark: Quark) -> Result<String> {
        Ok(self.inner.read().node(quark)?.name.clone())
    }

    /// Parent of `quark`, `None` for top-level attributes.
    pub fn parent_of(&self, quark: Quark) -> Result<Option<Quark>> {
        Ok(self.inner.read().node(quark)?.parent)
    }

    pub fn contains(&self, quark: Quark) -> bool {
        quark.index() < self.inner.read().nodes.len()
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize the whole tree (MessagePack).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        let nodes: Vec<SerializedNode> = inner
            .nodes
            .iter()
            .map(|n| SerializedNode {
                parent: n.parent,
                name: n.name.clone(),
            })
            .collect();
        Ok(rmp_serde::to_vec(&nodes)?)
    }

    /// Rebuild a tree from [`AttributeTree::to_bytes`] output.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let tree = Self::new();
        tree.load_bytes(bytes)?;
        Ok(tree)
    }

    /// Replace the content of an empty tree with serialized nodes.
    pub fn load_bytes(&self, bytes: &[u8]) -> Result<()> {
        let nodes: Vec<SerializedNode> = rmp_serde::from_slice(bytes)?;
        let mut inner = self.inner.write();
        if !inner.nodes.is_empty() {
            return Err(StateError::InvalidOperation(
                "attribute tree is not empty".to_string(),
            ));
        }
        for (index, node) in nodes.iter().enumerate() {
            if let Some(p) = node.parent {
                if p.index() >= index {
                    return Err(StateError::InvalidFormat(format!(
                        "attribute {} refers to later parent {}",
                        index, p
                    )));
                }
            }
            inner.add_child(node.parent, &node.name)?;
        }
        Ok(())
    }
}

impl Default for AttributeTree {
    fn default() -> Self {
        Self::new()
    }
}
