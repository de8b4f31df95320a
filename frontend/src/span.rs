/// Source location and span tracking.
///
/// Every token and AST node carries a [`Span`] recording the file it came
/// from and where in that file it appeared. File identities are indices
/// into the per-compile [`SourceFiles`] table, so spans stay `Copy` and can
/// be serialized into a precompiled header.
use serde::{Deserialize, Serialize};

/// Index of a file in a [`SourceFiles`] table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(pub u32);

/// A single position in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pos {
    /// Byte offset from the start of the file (0-based).
    pub offset: usize,
    /// Line number (1-based).
    pub line: usize,
    /// Column number (1-based, in bytes).
    pub column: usize,
}

impl Pos {
    pub const fn new(offset: usize, line: usize, column: usize) -> Self {
        Self {
            offset,
            line,
            column,
        }
    }

    pub const fn origin() -> Self {
        Self {
            offset: 0,
            line: 1,
            column: 1,
        }
    }
}

impl Default for Pos {
    fn default() -> Self {
        Self::origin()
    }
}

impl std::fmt::Display for Pos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A contiguous region of one source file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub file: FileId,
    pub start: Pos,
    pub end: Pos,
}

impl Span {
    pub const fn new(file: FileId, start: Pos, end: Pos) -> Self {
        Self { file, start, end }
    }

    /// Zero-width span at a single position.
    pub const fn point(file: FileId, pos: Pos) -> Self {
        Self {
            file,
            start: pos,
            end: pos,
        }
    }

    /// Merge two spans into one that covers both. Spans from different
    /// files keep `self`.
    pub fn merge(self, other: Span) -> Span {
        if self.file != other.file {
            return self;
        }
        let start = if self.start.offset <= other.start.offset {
            self.start
        } else {
            other.start
        };
        let end = if self.end.offset >= other.end.offset {
            self.end
        } else {
            other.end
        };
        Span {
            file: self.file,
            start,
            end,
        }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Names of every file that contributed tokens to one compile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceFiles {
    names: Vec<String>,
}

impl SourceFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`, returning the existing id when it is already known.
    pub fn add(&mut self, name: &str) -> FileId {
        if let Some(index) = self.names.iter().position(|n| n == name) {
            return FileId(index as u32);
        }
        self.names.push(name.to_string());
        FileId((self.names.len() - 1) as u32)
    }

    pub fn name(&self, id: FileId) -> &str {
        self.names
            .get(id.0 as usize)
            .map(String::as_str)
            .unwrap_or("<unknown>")
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_covers_both() {
        let file = FileId(0);
        let a = Span::new(file, Pos::new(4, 1, 5), Pos::new(8, 1, 9));
        let b = Span::new(file, Pos::new(0, 1, 1), Pos::new(6, 1, 7));
        let merged = a.merge(b);
        assert_eq!(merged.start.offset, 0);
        assert_eq!(merged.end.offset, 8);
    }

    #[test]
    fn files_are_interned() {
        let mut files = SourceFiles::new();
        let a = files.add("a.cpp");
        let b = files.add("b.h");
        assert_eq!(files.add("a.cpp"), a);
        assert_ne!(a, b);
        assert_eq!(files.name(b), "b.h");
        assert_eq!(files.name(FileId(42)), "<unknown>");
    }
}
