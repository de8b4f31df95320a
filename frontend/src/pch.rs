//! Precompiled header cache.
//!
//! Layout: the magic `HJITPCH\0`, a little-endian `u32` format version,
//! then one JSON document holding the header's source file table, the
//! macros it leaves defined, its parsed items and its library requests.
//! Spans inside the cached items index into the cached file table, so a
//! compile that applies the header seeds its diagnostics with that table.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ast::Item;
use crate::preprocess::MacroDef;
use crate::span::SourceFiles;

const PCH_MAGIC: &[u8; 8] = b"HJITPCH\0";
const PCH_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PchError {
    #[error("i/o error on precompiled header '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("'{}' is not a precompiled header", .0.display())]
    BadMagic(PathBuf),
    #[error("precompiled header '{}' has unsupported version {found}", .path.display())]
    Version { path: PathBuf, found: u32 },
    #[error("precompiled header source has errors")]
    CompileFailed,
    #[error("malformed precompiled header '{}': {source}", .path.display())]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrecompiledHeader {
    pub files: SourceFiles,
    pub macros: Vec<MacroDef>,
    pub items: Vec<Item>,
    pub libraries: Vec<String>,
}

impl PrecompiledHeader {
    /// Every typedef name the header introduces, at any namespace depth.
    pub fn typedef_names(&self) -> Vec<String> {
        fn collect(items: &[Item], out: &mut Vec<String>) {
            for item in items {
                match item {
                    Item::Typedef(decl) => out.push(decl.name.clone()),
                    Item::Namespace { items, .. } | Item::CLinkage { items, .. } => {
                        collect(items, out)
                    }
                    Item::Function(_) | Item::Variable(_) => {}
                }
            }
        }
        let mut names = Vec::new();
        collect(&self.items, &mut names);
        names
    }

    /// Writes the cache next to `path` and renames it into place, so a
    /// failed save never leaves a truncated cache behind.
    pub fn save(&self, path: &Path) -> Result<(), PchError> {
        let io_error = |source| PchError::Io {
            path: path.to_path_buf(),
            source,
        };
        let partial = partial_path(path);
        let written = self.write(&partial).and_then(|()| {
            fs::rename(&partial, path).map_err(io_error)
        });
        if written.is_err() {
            let _ = fs::remove_file(&partial);
        }
        written
    }

    fn write(&self, path: &Path) -> Result<(), PchError> {
        let io_error = |source| PchError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = BufWriter::new(File::create(path).map_err(io_error)?);
        writer.write_all(PCH_MAGIC).map_err(io_error)?;
        write_u32(&mut writer, PCH_VERSION).map_err(io_error)?;
        serde_json::to_writer(&mut writer, self).map_err(|source| PchError::Format {
            path: path.to_path_buf(),
            source,
        })?;
        writer.flush().map_err(io_error)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, PchError> {
        let io_error = |source| PchError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = BufReader::new(File::open(path).map_err(io_error)?);

        let mut magic = [0u8; 8];
        if reader.read_exact(&mut magic).is_err() || &magic != PCH_MAGIC {
            return Err(PchError::BadMagic(path.to_path_buf()));
        }
        let version = read_u32(&mut reader).map_err(io_error)?;
        if version != PCH_VERSION {
            return Err(PchError::Version {
                path: path.to_path_buf(),
                found: version,
            });
        }
        serde_json::from_reader(reader).map_err(|source| PchError::Format {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

fn write_u32(w: &mut dyn Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u32(r: &mut dyn Read) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::TypedefDecl;
    use crate::span::Span;
    use tempdir::TempDir;

    fn typedef_item(name: &str) -> Item {
        Item::Typedef(TypedefDecl {
            name: name.to_string(),
            ty: crate::ast::TypeExpr {
                spec: crate::ast::TypeSpec::Int(crate::ast::IntKind::Int),
                is_const: false,
                pointers: Vec::new(),
                array: None,
                span: Span::default(),
            },
            span: Span::default(),
        })
    }

    #[test]
    fn save_and_load() {
        let dir = TempDir::new("hostjit-pch").unwrap();
        let path = dir.path().join("prelude.pch");
        let mut files = SourceFiles::new();
        files.add("prelude.h");
        let header = PrecompiledHeader {
            files,
            macros: Vec::new(),
            items: vec![Item::Namespace {
                name: "util".into(),
                items: vec![typedef_item("word")],
                span: Span::default(),
            }],
            libraries: vec!["m".into()],
        };
        header.save(&path).unwrap();

        let loaded = PrecompiledHeader::load(&path).unwrap();
        assert_eq!(loaded.files.names(), ["prelude.h"]);
        assert_eq!(loaded.libraries, ["m"]);
        assert_eq!(loaded.typedef_names(), ["word"]);
    }

    #[test]
    fn saving_replaces_the_cache_whole() {
        let dir = TempDir::new("hostjit-pch").unwrap();
        let path = dir.path().join("prelude.pch");
        std::fs::write(&path, b"stale").unwrap();

        let header = PrecompiledHeader {
            libraries: vec!["m".into()],
            ..PrecompiledHeader::default()
        };
        header.save(&path).unwrap();
        assert_eq!(PrecompiledHeader::load(&path).unwrap().libraries, ["m"]);
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, ["prelude.pch"]);
    }

    #[test]
    fn failed_saves_leave_the_target_alone() {
        let dir = TempDir::new("hostjit-pch").unwrap();
        // a directory cannot be replaced by the finished cache
        let path = dir.path().join("taken.pch");
        std::fs::create_dir(&path).unwrap();

        let err = PrecompiledHeader::default().save(&path).err().unwrap();
        assert!(matches!(err, PchError::Io { .. }));
        assert!(path.is_dir());
        assert!(!partial_path(&path).exists());
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = TempDir::new("hostjit-pch").unwrap();
        let path = dir.path().join("not-a-header.pch");
        std::fs::write(&path, b"#pragma once\n").unwrap();
        assert!(matches!(
            PrecompiledHeader::load(&path),
            Err(PchError::BadMagic(_))
        ));

        let mut bytes = PCH_MAGIC.to_vec();
        bytes.extend_from_slice(&(PCH_VERSION + 1).to_le_bytes());
        bytes.extend_from_slice(b"{}");
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            PrecompiledHeader::load(&path),
            Err(PchError::Version { found, .. }) if found == PCH_VERSION + 1
        ));
    }
}
