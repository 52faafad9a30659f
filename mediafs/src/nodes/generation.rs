use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{path_segments, DirectoryNode, Locator, Node};

/// An immutable, fully built tree plus its sequence number.
///
/// Generations are shared via [Arc] between the tree manager and any reader
/// that resolved a path in it. Building a new generation from an old one
/// (incremental scans, targeted rescans) shares all unchanged subtrees.
#[derive(Clone, Debug)]
pub struct Generation {
    sequence: u64,
    /// Seconds since the unix epoch.
    created_at: u64,
    root: Arc<Node>,
    node_count: u64,
}

impl Generation {
    pub fn new(sequence: u64, created_at: u64, root: DirectoryNode) -> Self {
        let root = Arc::new(Node::Directory(root));
        let node_count = root.count();
        Self {
            sequence,
            created_at,
            root,
            node_count,
        }
    }

    /// The generation a mount starts with when nothing could be recovered.
    pub fn empty() -> Self {
        Self::new(0, 0, empty_root())
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn node_count(&self) -> u64 {
        self.node_count
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    pub fn root_directory(&self) -> &DirectoryNode {
        self.root
            .as_directory()
            .expect("generation root is always a directory")
    }

    /// Returns the same tree under a different sequence number.
    pub fn with_sequence(&self, sequence: u64) -> Self {
        Self {
            sequence,
            ..self.clone()
        }
    }

    /// Walks the path segment by segment. Returns [None] if any segment is
    /// missing or a non-final segment is a file.
    pub fn resolve(&self, path: &str) -> Option<Arc<Node>> {
        let mut current = self.root.clone();
        for segment in path_segments(path) {
            let next = current.as_directory()?.get(segment)?.clone();
            current = next;
        }
        Some(current)
    }

    /// Builds a new root with the node at `path` replaced by `replacement`.
    /// Directories along the way are copied, everything else is shared.
    /// Returns [None] if the parent of `path` doesn't exist.
    pub fn graft(&self, path: &str, replacement: Arc<Node>) -> Option<DirectoryNode> {
        let segments = path_segments(path);
        if segments.is_empty() {
            return replacement.as_directory().cloned();
        }
        graft_into(self.root_directory(), &segments, replacement)
    }

    /// Serializes the tree (not the sequence or timestamp). Two generations
    /// with equal trees serialize to identical bytes.
    pub fn encode_tree(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self.root.as_ref())
    }

    /// Reconstructs a generation from [Generation::encode_tree] output.
    pub fn decode_tree(sequence: u64, created_at: u64, data: &[u8]) -> Result<Self, String> {
        let root: Node = serde_json::from_slice(data).map_err(|e| e.to_string())?;
        match root {
            Node::Directory(directory) => {
                validate_directory(&directory)?;
                Ok(Self::new(sequence, created_at, directory))
            }
            Node::File(_) => Err("root node is not a directory".to_string()),
        }
    }
}

impl PartialEq for Generation {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
            && self.created_at == other.created_at
            && self.root == other.root
    }
}

fn empty_root() -> DirectoryNode {
    DirectoryNode::new("", "", Locator::new(""), None, BTreeMap::new())
}

fn graft_into(
    directory: &DirectoryNode,
    segments: &[&str],
    replacement: Arc<Node>,
) -> Option<DirectoryNode> {
    let (first, rest) = segments.split_first()?;
    if rest.is_empty() {
        return Some(directory.with_child(replacement));
    }

    let child = directory.get(first)?.as_directory()?;
    let updated = graft_into(child, rest, replacement)?;
    Some(directory.with_child(Arc::new(Node::Directory(updated))))
}

/// Ensures child map keys match the children's names, so a decoded tree
/// can't alias paths.
fn validate_directory(directory: &DirectoryNode) -> Result<(), String> {
    for (name, child) in directory.children() {
        if name != child.name() {
            return Err(format!(
                "child keyed {:?} is named {:?}",
                name,
                child.name()
            ));
        }
        if name.is_empty() || name.contains('/') || name.contains('\0') {
            return Err(format!("invalid child name {:?}", name));
        }
        if let Node::Directory(d) = child.as_ref() {
            validate_directory(d)?;
        }
    }
    Ok(())
}

/// Seconds since the unix epoch, used for generation and record timestamps.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::Generation;
    use crate::fixtures;
    use crate::nodes::{FileNode, Node};

    #[test]
    fn resolve_walks_segments() {
        let generation = fixtures::sample_generation(1);

        assert!(generation.resolve("/").is_some());
        let movie = generation
            .resolve("/Movies/Alien (1979).mkv")
            .expect("must resolve");
        assert_eq!(fixtures::ALIEN_CONTENTS.len() as u64, movie.as_file().unwrap().size());

        assert!(generation.resolve("/Movies/Nope").is_none());
        // a file in the middle of a path
        assert!(generation.resolve("/Movies/Alien (1979).mkv/x").is_none());
    }

    #[test]
    fn graft_shares_untouched_subtrees() {
        let generation = fixtures::sample_generation(1);
        let replacement = Arc::new(Node::File(FileNode::new(
            "99",
            "Extra.mkv",
            "/library/parts/99/file.mkv".into(),
            1,
            0,
        )));

        let root = generation.graft("/Movies/Extra.mkv", replacement).unwrap();
        let grafted = Generation::new(2, 0, root);

        assert!(grafted.resolve("/Movies/Extra.mkv").is_some());
        assert!(generation.resolve("/Movies/Extra.mkv").is_none());
        assert!(Arc::ptr_eq(
            &generation.resolve("/TV Shows").unwrap(),
            &grafted.resolve("/TV Shows").unwrap()
        ));
        assert_eq!(generation.node_count() + 1, grafted.node_count());
    }

    #[test]
    fn graft_missing_parent() {
        let generation = fixtures::sample_generation(1);
        let replacement = generation.resolve("/Movies").unwrap();
        assert!(generation.graft("/Nope/Movies", replacement).is_none());
    }

    #[test]
    fn encode_decode() {
        let generation = fixtures::sample_generation(3);
        let data = generation.encode_tree().unwrap();

        let decoded = Generation::decode_tree(3, generation.created_at(), &data).unwrap();
        assert_eq!(generation, decoded);
        assert_eq!(generation.node_count(), decoded.node_count());
    }

    #[test]
    fn decode_rejects_file_root() {
        let data = br#"{"kind":"file","id":"1","name":"x","locator":"/x","size":1,"modified":0}"#;
        assert!(Generation::decode_tree(1, 0, data).is_err());
    }

    #[test]
    fn decode_rejects_mismatched_key() {
        let data = br#"{"kind":"directory","id":"","name":"","locator":"","children":{"a":{"kind":"file","id":"1","name":"b","locator":"/x","size":1,"modified":0}}}"#;
        assert!(Generation::decode_tree(1, 0, data).is_err());
    }
}
