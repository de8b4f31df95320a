use std::io;
use std::path::PathBuf;

use cranelift_codegen::CodegenError;
use cranelift_codegen::settings::SetError;
use cranelift_module::ModuleError;
use thiserror::Error;

use crate::region::RegionState;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("unresolved symbols in {unit}: {}", .names.join(", "))]
    UnresolvedSymbols { unit: String, names: Vec<String> },
    #[error("duplicate definition of '{name}' in region '{region}'")]
    DuplicateSymbol { region: String, name: String },
    #[error("incompatible relocation in {object}: {detail}")]
    IncompatibleRelocation { object: String, detail: String },
    #[error("symbol '{name}' is not defined in region '{region}'")]
    UndefinedSymbol { region: String, name: String },
    #[error("a code region named '{0}' already exists")]
    DuplicateRegion(String),
    #[error("module '{0}' is empty and cannot be added")]
    EmptyModule(String),
    #[error("cannot {operation} region '{region}' while it is {state}")]
    InvalidState {
        region: String,
        operation: &'static str,
        state: RegionState,
    },
    #[error("region '{0}' failed to link and must be destroyed")]
    RegionFailed(String),
    #[error("region '{0}' has been destroyed")]
    RegionDestroyed(String),
    #[error("import archive '{}': {message}", .path.display())]
    Archive { path: PathBuf, message: String },
    #[error("code generation failed for '{function}': {message}")]
    Codegen { function: String, message: String },
    #[error(transparent)]
    Module(#[from] ModuleError),
}

impl LinkError {
    /// Errors that leave a region unusable.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            LinkError::UnresolvedSymbols { .. }
                | LinkError::DuplicateSymbol { .. }
                | LinkError::IncompatibleRelocation { .. }
                | LinkError::Archive { .. }
                | LinkError::Codegen { .. }
                | LinkError::Module(_)
        )
    }

    pub(crate) fn archive(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        LinkError::Archive {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn relocation(object: impl Into<String>, detail: impl Into<String>) -> Self {
        LinkError::IncompatibleRelocation {
            object: object.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("host machine is not supported: {0}")]
    HostDetection(String),
    #[error("invalid code generator setting: {0}")]
    Flag(#[from] SetError),
    #[error("cannot build target isa: {0}")]
    Isa(#[from] CodegenError),
    #[error("cannot start compile workers: {0}")]
    WorkerPool(#[source] io::Error),
    #[error("cannot load import archive: {0}")]
    Archive(#[source] LinkError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_classification() {
        let unresolved = LinkError::UnresolvedSymbols {
            unit: "region 'a'".into(),
            names: vec!["f".into(), "g".into()],
        };
        assert!(unresolved.is_link_failure());
        assert_eq!(unresolved.to_string(), "unresolved symbols in region 'a': f, g");

        let missing = LinkError::UndefinedSymbol {
            region: "a".into(),
            name: "f".into(),
        };
        assert!(!missing.is_link_failure());
        assert!(!LinkError::RegionDestroyed("a".into()).is_link_failure());
    }
}
