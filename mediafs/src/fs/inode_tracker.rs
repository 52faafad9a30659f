use std::collections::HashMap;

/// Inode of the mount root.
pub const ROOT_ID: u64 = 1;

/// InodeTracker hands out inodes for virtual paths.
///
/// Paths, not nodes, get inodes: a path keeps its inode across generations,
/// so the kernel's cached entries stay valid when a new tree is published.
/// Inodes are never reused within the lifetime of a mount.
pub struct InodeTracker {
    paths: HashMap<u64, String>,
    inodes: HashMap<String, u64>,

    // the next inode to allocate
    next_inode: u64,
}

impl Default for InodeTracker {
    fn default() -> Self {
        let mut tracker = Self {
            paths: HashMap::new(),
            inodes: HashMap::new(),
            next_inode: ROOT_ID + 1,
        };
        tracker.paths.insert(ROOT_ID, "/".to_string());
        tracker.inodes.insert("/".to_string(), ROOT_ID);
        tracker
    }
}

impl InodeTracker {
    /// Returns the path an inode was allocated for.
    pub fn path(&self, ino: u64) -> Option<&str> {
        self.paths.get(&ino).map(String::as_str)
    }

    pub fn get(&self, path: &str) -> Option<u64> {
        self.inodes.get(path).copied()
    }

    /// Returns the inode for `path`, allocating one if needed.
    pub fn put(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.inodes.get(path) {
            return *ino;
        }

        let ino = self.next_inode;
        self.next_inode += 1;
        self.paths.insert(ino, path.to_string());
        self.inodes.insert(path.to_string(), ino);
        ino
    }
}

#[cfg(test)]
mod tests {
    use super::{InodeTracker, ROOT_ID};

    #[test]
    fn root() {
        let tracker = InodeTracker::default();
        assert_eq!(Some("/"), tracker.path(ROOT_ID));
        assert_eq!(Some(ROOT_ID), tracker.get("/"));
    }

    #[test]
    fn put_is_stable() {
        let mut tracker = InodeTracker::default();

        let movies = tracker.put("/Movies");
        let alien = tracker.put("/Movies/Alien (1979).mkv");
        assert_ne!(movies, alien);
        assert_ne!(ROOT_ID, movies);

        assert_eq!(movies, tracker.put("/Movies"));
        assert_eq!(Some(alien), tracker.get("/Movies/Alien (1979).mkv"));
        assert_eq!(Some("/Movies/Alien (1979).mkv"), tracker.path(alien));
        assert_eq!(None, tracker.path(alien + 1));
    }
}
