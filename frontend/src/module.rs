//! The compiled-but-unlinked output of one `compile` call.
//!
//! Function bodies are kept as Cranelift IR so the engine can defer
//! machine-code generation until an address is first requested. IR refers
//! to other symbols through `UserExternalName`s whose namespace is
//! [`FUNCTION_NAMESPACE`] or [`DATA_NAMESPACE`] and whose index is the
//! position of the symbol in [`ModuleContents::symbols`].

use std::fmt;

use cranelift_codegen::ir;

pub const FUNCTION_NAMESPACE: u32 = 0;
pub const DATA_NAMESPACE: u32 = 1;

/// Prefix of the control block emitted for each thread-local variable.
pub const TLS_CONTROL_PREFIX: &str = "__emutls_v.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolLinkage {
    /// Referenced but not defined here.
    Import,
    /// Defined here and visible only inside this module.
    Local,
    /// Defined here and visible to every module of the region.
    Export,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolKind {
    Function(ir::Signature),
    Data { writable: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSymbol {
    pub name: String,
    pub kind: SymbolKind,
    pub linkage: SymbolLinkage,
}

impl ModuleSymbol {
    pub fn is_function(&self) -> bool {
        matches!(self.kind, SymbolKind::Function(_))
    }

    pub fn is_defined(&self) -> bool {
        self.linkage != SymbolLinkage::Import
    }
}

/// One defined function.
#[derive(Debug, Clone)]
pub struct FunctionBody {
    pub symbol: usize,
    pub function: ir::Function,
    /// Symbols called directly, used to compile a lookup's closure.
    pub callees: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataContents {
    Bytes(Vec<u8>),
    Zeroed(usize),
}

impl DataContents {
    pub fn len(&self) -> usize {
        match self {
            DataContents::Bytes(bytes) => bytes.len(),
            DataContents::Zeroed(len) => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An absolute pointer-sized relocation inside a data object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRelocation {
    pub offset: u32,
    pub symbol: usize,
    pub addend: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBody {
    pub symbol: usize,
    pub contents: DataContents,
    pub align: u64,
    pub relocations: Vec<DataRelocation>,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleContents {
    pub symbols: Vec<ModuleSymbol>,
    pub functions: Vec<FunctionBody>,
    pub data: Vec<DataBody>,
    /// `void()` function running dynamic initializers, if any.
    pub initializer: Option<usize>,
    /// `void()` function releasing per-thread storage, if any.
    pub finalizer: Option<usize>,
    pub constructors: Vec<usize>,
    pub destructors: Vec<usize>,
    /// Libraries requested with `#pragma comment(lib, ...)`.
    pub libraries: Vec<String>,
}

impl ModuleContents {
    pub fn symbol_index(&self, name: &str) -> Option<usize> {
        self.symbols.iter().position(|s| s.name == name)
    }

    pub fn symbol(&self, name: &str) -> Option<&ModuleSymbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    pub fn function(&self, symbol: usize) -> Option<&FunctionBody> {
        self.functions.iter().find(|f| f.symbol == symbol)
    }

    pub fn exports(&self) -> impl Iterator<Item = &ModuleSymbol> {
        self.symbols
            .iter()
            .filter(|s| s.linkage == SymbolLinkage::Export)
    }

    pub fn imports(&self) -> impl Iterator<Item = &ModuleSymbol> {
        self.symbols
            .iter()
            .filter(|s| s.linkage == SymbolLinkage::Import)
    }
}

/// Either populated, or empty when the compile reported an error.
#[derive(Debug, Clone)]
pub struct IntermediateModule {
    pub name: String,
    contents: Option<ModuleContents>,
}

impl IntermediateModule {
    pub fn new(name: impl Into<String>, contents: ModuleContents) -> Self {
        Self {
            name: name.into(),
            contents: Some(contents),
        }
    }

    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_none()
    }

    pub fn contents(&self) -> Option<&ModuleContents> {
        self.contents.as_ref()
    }

    pub fn into_contents(self) -> Option<ModuleContents> {
        self.contents
    }
}

/// Textual listing of symbols, data and IR, for `hostjit check --emit-ir`.
impl fmt::Display for IntermediateModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(contents) = &self.contents else {
            return writeln!(f, "; module {} (empty)", self.name);
        };
        writeln!(f, "; module {}", self.name)?;
        for (index, symbol) in contents.symbols.iter().enumerate() {
            let kind = match &symbol.kind {
                SymbolKind::Function(_) => "function",
                SymbolKind::Data { writable: true } => "data",
                SymbolKind::Data { writable: false } => "rodata",
            };
            writeln!(f, "; {index:>3} {:?} {kind} {}", symbol.linkage, symbol.name)?;
        }
        for data in &contents.data {
            let name = &contents.symbols[data.symbol].name;
            writeln!(
                f,
                "; data {name}: {} bytes, align {}, {} relocations",
                data.contents.len(),
                data.align,
                data.relocations.len()
            )?;
        }
        for body in &contents.functions {
            writeln!(f, "; {}", contents.symbols[body.symbol].name)?;
            writeln!(f, "{}", body.function.display())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_module_is_a_sentinel() {
        let module = IntermediateModule::empty("broken");
        assert!(module.is_empty());
        assert!(module.contents().is_none());
        assert!(module.to_string().contains("(empty)"));
    }

    #[test]
    fn symbol_queries() {
        let contents = ModuleContents {
            symbols: vec![
                ModuleSymbol {
                    name: "puts".into(),
                    kind: SymbolKind::Data { writable: false },
                    linkage: SymbolLinkage::Import,
                },
                ModuleSymbol {
                    name: "counter".into(),
                    kind: SymbolKind::Data { writable: true },
                    linkage: SymbolLinkage::Export,
                },
            ],
            ..Default::default()
        };
        assert_eq!(contents.symbol_index("counter"), Some(1));
        assert_eq!(contents.exports().count(), 1);
        assert_eq!(contents.imports().next().map(|s| s.name.as_str()), Some("puts"));
        assert!(!contents.symbols[0].is_defined());
    }
}
