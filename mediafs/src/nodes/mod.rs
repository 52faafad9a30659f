//! The virtual tree model: a closed set of node kinds, plus the immutable
//! [Generation] snapshot built from them.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod generation;
mod path;

pub use self::generation::{now_unix, Generation};
pub use self::path::{disambiguate_name, join_path, path_segments, sanitize_name};

/// An opaque reference into the remote catalog. The fetch layer knows how to
/// turn it into a listing request or a byte-range request, nobody else looks
/// inside.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Locator {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Directory,
    File,
}

/// A single entry of the virtual filesystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Node {
    Directory(DirectoryNode),
    File(FileNode),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Directory(d) => &d.name,
            Node::File(f) => &f.name,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Node::Directory(d) => &d.id,
            Node::File(f) => &f.id,
        }
    }

    pub fn locator(&self) -> &Locator {
        match self {
            Node::Directory(d) => &d.locator,
            Node::File(f) => &f.locator,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Directory(_) => NodeKind::Directory,
            Node::File(_) => NodeKind::File,
        }
    }

    pub fn as_directory(&self) -> Option<&DirectoryNode> {
        match self {
            Node::Directory(d) => Some(d),
            Node::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match self {
            Node::File(f) => Some(f),
            Node::Directory(_) => None,
        }
    }

    /// Number of nodes in this subtree, including self.
    pub fn count(&self) -> u64 {
        match self {
            Node::File(_) => 1,
            Node::Directory(d) => 1 + d.children.values().map(|c| c.count()).sum::<u64>(),
        }
    }
}

/// A directory, holding its children ordered by name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    id: String,
    name: String,
    locator: Locator,
    /// Remote update counter, if the catalog provides one for this entry.
    /// Used by incremental scans to decide whether to re-walk the subtree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    change_marker: Option<u64>,
    children: BTreeMap<String, Arc<Node>>,
}

impl DirectoryNode {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        locator: Locator,
        change_marker: Option<u64>,
        children: BTreeMap<String, Arc<Node>>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            locator,
            change_marker,
            children,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn change_marker(&self) -> Option<u64> {
        self.change_marker
    }

    pub fn children(&self) -> &BTreeMap<String, Arc<Node>> {
        &self.children
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Node>> {
        self.children.get(name)
    }

    /// Returns a copy of this directory with `child` inserted (or replaced)
    /// under its name. The other children are shared, not cloned.
    pub fn with_child(&self, child: Arc<Node>) -> Self {
        let mut children = self.children.clone();
        children.insert(child.name().to_string(), child);
        Self {
            children,
            ..self.clone_shallow()
        }
    }

    fn clone_shallow(&self) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            locator: self.locator.clone(),
            change_marker: self.change_marker,
            children: BTreeMap::new(),
        }
    }
}

/// A regular, read-only file whose contents are served by the remote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    id: String,
    name: String,
    locator: Locator,
    size: u64,
    /// Seconds since the unix epoch.
    modified: u64,
}

impl FileNode {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        locator: Locator,
        size: u64,
        modified: u64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            locator,
            size,
            modified,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn modified(&self) -> u64 {
        self.modified
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::{DirectoryNode, FileNode, Locator, Node};

    fn file(name: &str) -> Arc<Node> {
        Arc::new(Node::File(FileNode::new(
            name,
            name,
            Locator::new(format!("/parts/{name}")),
            3,
            0,
        )))
    }

    #[test]
    fn with_child_shares_siblings() {
        let a = file("a");
        let dir = DirectoryNode::new(
            "d",
            "d",
            "/d".into(),
            None,
            BTreeMap::from([("a".to_string(), a.clone())]),
        );

        let updated = dir.with_child(file("b"));

        assert_eq!(1, dir.children().len(), "original must be untouched");
        assert_eq!(2, updated.children().len());
        assert!(Arc::ptr_eq(&a, updated.get("a").unwrap()));
    }

    #[test]
    fn count_includes_self() {
        let dir = Node::Directory(DirectoryNode::new(
            "d",
            "d",
            "/d".into(),
            None,
            BTreeMap::from([("a".to_string(), file("a")), ("b".to_string(), file("b"))]),
        ));
        assert_eq!(3, dir.count());
    }

    #[test]
    fn serializes_kind_tag() {
        let json = serde_json::to_string(&*file("a")).unwrap();
        assert!(json.starts_with(r#"{"kind":"file""#), "got {json}");
    }
}
