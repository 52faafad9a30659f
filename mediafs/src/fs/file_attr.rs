#![allow(clippy::unnecessary_cast)] // libc::S_IFDIR is u32 on Linux and u16 on MacOS

use crate::nodes::{Node, NodeKind};

/// Attributes of a node as presented to the kernel. Everything is read-only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileAttributes {
    pub kind: NodeKind,
    pub size: u64,
    /// Seconds since the unix epoch.
    pub mtime: u64,
    pub mode: u32,
    pub nlink: u32,
}

impl FileAttributes {
    /// Directories carry no timestamp of their own, they get
    /// `directory_mtime` (the generation's creation time).
    pub fn of(node: &Node, directory_mtime: u64) -> Self {
        match node {
            Node::Directory(_) => Self {
                kind: NodeKind::Directory,
                size: 0,
                mtime: directory_mtime,
                mode: libc::S_IFDIR as u32 | 0o555,
                nlink: 2,
            },
            Node::File(file) => Self {
                kind: NodeKind::File,
                size: file.size(),
                mtime: file.modified(),
                mode: libc::S_IFREG as u32 | 0o444,
                nlink: 1,
            },
        }
    }

    /// The `d_type` for directory entries.
    #[cfg(feature = "fuse")]
    pub fn entry_type(&self) -> u32 {
        match self.kind {
            NodeKind::Directory => libc::S_IFDIR as u32,
            NodeKind::File => libc::S_IFREG as u32,
        }
    }

    #[cfg(feature = "fuse")]
    pub fn to_attr(&self, ino: u64) -> fuse_backend_rs::abi::fuse_abi::Attr {
        fuse_backend_rs::abi::fuse_abi::Attr {
            ino,
            size: self.size,
            // FUSE expects the number of 512b blocks
            blocks: self.size.div_ceil(512),
            blksize: 1024,
            mode: self.mode,
            atime: self.mtime,
            mtime: self.mtime,
            ctime: self.mtime,
            nlink: self.nlink,
            ..Default::default()
        }
    }
}
