//! Inode numbers for store paths, handed out on first lookup.

use std::collections::HashMap;

use dvfs_core::paths;

pub const ROOT_INO: u64 = 1;

pub struct InodeTable {
    paths: HashMap<u64, String>,
    inodes: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inodes: HashMap::new(),
            next: ROOT_INO + 1,
        };
        table.paths.insert(ROOT_INO, paths::ROOT.to_string());
        table.inodes.insert(paths::ROOT.to_string(), ROOT_INO);
        table
    }

    pub fn path(&self, ino: u64) -> Option<&str> {
        self.paths.get(&ino).map(String::as_str)
    }

    /// Path of `name` inside the directory `parent`.
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        self.path(parent).map(|dir| paths::join(dir, name))
    }

    /// Inode for `path`, allocating one if the path is new.
    pub fn ino(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.inodes.get(path) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.paths.insert(ino, path.to_string());
        self.inodes.insert(path.to_string(), ino);
        ino
    }

    /// Drop `path` and everything below it.
    pub fn forget(&mut self, path: &str) {
        let gone: Vec<String> = self
            .inodes
            .keys()
            .filter(|p| paths::is_within(p, path))
            .cloned()
            .collect();
        for p in gone {
            if let Some(ino) = self.inodes.remove(&p) {
                self.paths.remove(&ino);
            }
        }
    }

    /// Keep inode numbers stable across a rename of `old` (and its subtree).
    pub fn rename(&mut self, old: &str, new: &str) {
        self.forget(new);
        let moved: Vec<(String, u64)> = self
            .inodes
            .iter()
            .filter(|(p, _)| paths::is_within(p, old))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (path, ino) in moved {
            let Some(target) = paths::rebase(&path, old, new) else {
                continue;
            };
            self.inodes.remove(&path);
            self.paths.insert(ino, target.clone());
            self.inodes.insert(target, ino);
        }
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
    fn test_inodes_are_stable_per_path() {
        let mut table = InodeTable::new();
        let a = table.ino("/a");
        assert_eq!(table.ino("/a"), a);
        assert_ne!(table.ino("/b"), a);
        assert_eq!(table.path(ROOT_INO), Some("/"));
        assert_eq!(table.child_path(a, "x").as_deref(), Some("/a/x"));
    }

    #[test]
    fn test_rename_moves_subtree_inodes() {
        let mut table = InodeTable::new();
        let dir = table.ino("/a");
        let file = table.ino("/a/f");
        let other = table.ino("/ab");

        table.rename("/a", "/z");
        assert_eq!(table.path(dir), Some("/z"));
        assert_eq!(table.path(file), Some("/z/f"));
        assert_eq!(table.path(other), Some("/ab"));
        assert_eq!(table.ino("/z/f"), file);
    }

    #[test]
    fn test_forget_drops_subtree() {
        let mut table = InodeTable::new();
        let file = table.ino("/a/f");
        table.forget("/a");
        assert_eq!(table.path(file), None);
    }
}
