//! # Frontend
//!
//! Turns source fragments of a small C/C++ dialect into
//! [`IntermediateModule`]s: symbol tables plus Cranelift IR that a link
//! engine compiles to machine code on demand.
//!
//! ```text
//!  source text
//!      │
//!      ▼
//!  ┌──────────────┐   tokens   ┌────────┐   items   ┌───────────────┐
//!  │ Preprocessor │ ─────────▶ │ Parser │ ────────▶ │ ModuleLowerer │ ──▶ IntermediateModule
//!  └──────────────┘            └────────┘           └───────────────┘
//!          │                        │                       │
//!          └───────── diagnostics ──┴───────────────────────┘──▶ DiagnosticSink
//! ```
//!
//! ```rust, ignore
//! use std::sync::Arc;
//! use frontend::{CompileFrontend, FrontendCreateInfo, LogSink};
//!
//! let mut frontend = CompileFrontend::new(FrontendCreateInfo::default(), Arc::new(LogSink))?;
//! let module = frontend.compile("extern \"C\" int one() { return 1; }", "one");
//! assert!(!module.is_empty());
//! ```

pub mod ast;
pub mod diagnostic;
pub mod frontend;
pub mod lexer;
mod lower;
pub mod mangle;
pub mod module;
pub mod parser;
pub mod pch;
pub mod preprocess;
pub mod span;
pub mod token;
pub mod types;
pub mod vfs;

pub use diagnostic::{
    CollectingSink, Diagnostic, DiagnosticSink, LogSink, Severity, SourceLocation, Tee,
};
pub use frontend::{CompileFrontend, FrontendCreateInfo, SharedFrontend};
pub use module::{
    DATA_NAMESPACE, DataBody, DataContents, DataRelocation, FUNCTION_NAMESPACE, FunctionBody,
    IntermediateModule, ModuleContents, ModuleSymbol, SymbolKind, SymbolLinkage,
    TLS_CONTROL_PREFIX,
};
pub use pch::{PchError, PrecompiledHeader};
pub use types::{TargetLayout, TargetOs};
