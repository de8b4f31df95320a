//! # Engine
//!
//! Links and runs [`frontend::IntermediateModule`]s inside the current
//! process.
//!
//! ```text
//!  LinkEngine ─── owns ──▶ CompilePool (workers compile IR to machine code)
//!      │        └─ owns ──▶ ResolverChain
//!      │                      1. host      static tables, then the process
//!      │                      2. archives  ar members, loaded on demand
//!      │                      3. libraries shared libraries named by
//!      │                                   archives and `#pragma comment`
//!      ▼
//!  CodeRegion ── add_module ──▶ declare symbols, define data
//!             ── lookup ──────▶ compile the closure, bind imports, finalize
//!             ── initialize / deinitialize / destroy
//! ```
//!
//! Thread-local variables are emulated: the runtime in [`runtime`] hands
//! out one instance per thread per control block.

pub mod archive;
pub mod engine;
pub mod error;
pub mod host;
pub mod image;
pub mod library;
mod loader;
pub mod pool;
pub mod region;
pub mod resolver;
pub mod runtime;
mod system;

pub use archive::{ArchiveResolver, ImportArchiveDescriptor};
pub use engine::{EngineCreateInfo, LinkEngine, OptLevel};
pub use error::{LinkError, SessionError};
pub use host::{HostResolver, HostSymbolDirectory, ProcessSymbols, StaticSymbols};
pub use image::ImageHeaderMode;
pub use library::LibraryResolver;
pub use pool::{CompilePool, PoolSettings};
pub use region::{CodeRegion, RegionState};
pub use resolver::{ResolverChain, ResolverStage, SymbolReference, SymbolResolver};
