//! File access for the preprocessor.
//!
//! Compiles never need to touch real storage for the module being
//! compiled: its text is placed in an in-memory layer that shadows the
//! native file system, so the same module name can be recompiled as often
//! as needed.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

pub trait FileSystem: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<String>;

    fn exists(&self, path: &Path) -> bool;
}

/// The process's real file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeFileSystem;

impl FileSystem for NativeFileSystem {
    fn read(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// In-memory files keyed by normalized path.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: RwLock<BTreeMap<PathBuf, Arc<str>>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a file.
    pub fn write(&self, path: impl AsRef<Path>, text: &str) {
        self.files
            .write()
            .insert(normalize(path.as_ref()), Arc::from(text));
    }

    pub fn remove(&self, path: impl AsRef<Path>) -> bool {
        self.files.write().remove(&normalize(path.as_ref())).is_some()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl FileSystem for MemoryFileSystem {
    fn read(&self, path: &Path) -> io::Result<String> {
        self.files
            .read()
            .get(&normalize(path))
            .map(|text| text.to_string())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no such file: {}", path.display()),
                )
            })
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.read().contains_key(&normalize(path))
    }
}

/// Stack of file systems; later layers shadow earlier ones.
#[derive(Clone, Default)]
pub struct OverlayFileSystem {
    layers: Vec<Arc<dyn FileSystem>>,
}

impl OverlayFileSystem {
    pub fn new(base: Arc<dyn FileSystem>) -> Self {
        Self { layers: vec![base] }
    }

    pub fn push_overlay(&mut self, layer: Arc<dyn FileSystem>) {
        self.layers.push(layer);
    }
}

impl FileSystem for OverlayFileSystem {
    fn read(&self, path: &Path) -> io::Result<String> {
        for layer in self.layers.iter().rev() {
            if layer.exists(path) {
                return layer.read(path);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such file: {}", path.display()),
        ))
    }

    fn exists(&self, path: &Path) -> bool {
        self.layers.iter().any(|layer| layer.exists(path))
    }
}

/// Lexically normalize a path: drop `.` components and fold `..`.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_paths_are_normalized() {
        let fs = MemoryFileSystem::new();
        fs.write("inc/./a.h", "int a;");
        assert!(fs.exists(Path::new("inc/sub/../a.h")));
        assert_eq!(fs.read(Path::new("inc/a.h")).unwrap(), "int a;");
        assert!(fs.remove("inc/a.h"));
        assert!(fs.is_empty());
    }

    #[test]
    fn overlay_shadows_lower_layers() {
        let lower = Arc::new(MemoryFileSystem::new());
        lower.write("x.h", "lower");
        lower.write("y.h", "only lower");
        let upper = Arc::new(MemoryFileSystem::new());
        upper.write("x.h", "upper");

        let mut overlay = OverlayFileSystem::new(lower);
        overlay.push_overlay(upper);
        assert_eq!(overlay.read(Path::new("x.h")).unwrap(), "upper");
        assert_eq!(overlay.read(Path::new("y.h")).unwrap(), "only lower");
        assert!(overlay.read(Path::new("z.h")).is_err());
    }

    #[test]
    fn native_reads_real_files() {
        let dir = tempdir::TempDir::new("vfs").unwrap();
        let path = dir.path().join("h.h");
        std::fs::write(&path, "#pragma once\n").unwrap();
        assert!(NativeFileSystem.exists(&path));
        assert_eq!(NativeFileSystem.read(&path).unwrap(), "#pragma once\n");
    }
}
