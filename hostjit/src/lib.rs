//! # hostjit
//!
//! Compile C/C++ fragments at run time and call them from the host.
//!
//! ```rust, ignore
//! use std::sync::Arc;
//! use hostjit::{EngineCreateInfo, FrontendCreateInfo, LinkEngine, LogSink};
//!
//! let engine = LinkEngine::new(EngineCreateInfo::default())?;
//! let mut frontend = hostjit::frontend_for(&engine, FrontendCreateInfo::default(), Arc::new(LogSink))?;
//! let mut region = engine.create_code_region("main")?;
//! region.add_module(frontend.compile("extern \"C\" int one() { return 1; }", "one"))?;
//! let one: extern "C" fn() -> i32 = unsafe { std::mem::transmute(region.lookup_address("one")?) };
//! ```

use std::sync::Arc;

pub use engine::{
    ArchiveResolver, CodeRegion, EngineCreateInfo, HostSymbolDirectory, ImageHeaderMode,
    ImportArchiveDescriptor, LinkEngine, LinkError, OptLevel, PoolSettings, RegionState,
    ResolverStage, SessionError, StaticSymbols, SymbolReference,
};
pub use frontend::{
    CollectingSink, CompileFrontend, Diagnostic, DiagnosticSink, FrontendCreateInfo,
    IntermediateModule, LogSink, PchError, Severity, SharedFrontend, Tee,
};

/// A frontend whose type layout matches the code `engine` generates.
pub fn frontend_for(
    engine: &LinkEngine,
    info: FrontendCreateInfo,
    sink: Arc<dyn DiagnosticSink>,
) -> Result<CompileFrontend, PchError> {
    CompileFrontend::new(
        FrontendCreateInfo {
            layout: engine.layout(),
            ..info
        },
        sink,
    )
}

/// Splits a `NAME[=VALUE]` macro definition.
pub fn parse_define(text: &str) -> (String, Option<String>) {
    match text.split_once('=') {
        Some((name, value)) => (name.to_string(), Some(value.to_string())),
        None => (text.to_string(), None),
    }
}

/// Calls `int entry(int...)` at `address` with up to four arguments.
///
/// # Safety
/// `address` must be a function taking `args.len()` `int`s and returning
/// `int` under the host C calling convention.
pub unsafe fn call_int_entry(address: usize, args: &[i32]) -> Option<i32> {
    type F0 = extern "C" fn() -> i32;
    type F1 = extern "C" fn(i32) -> i32;
    type F2 = extern "C" fn(i32, i32) -> i32;
    type F3 = extern "C" fn(i32, i32, i32) -> i32;
    type F4 = extern "C" fn(i32, i32, i32, i32) -> i32;
    // SAFETY: forwarded contract
    unsafe {
        Some(match *args {
            [] => std::mem::transmute::<usize, F0>(address)(),
            [a] => std::mem::transmute::<usize, F1>(address)(a),
            [a, b] => std::mem::transmute::<usize, F2>(address)(a, b),
            [a, b, c] => std::mem::transmute::<usize, F3>(address)(a, b, c),
            [a, b, c, d] => std::mem::transmute::<usize, F4>(address)(a, b, c, d),
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defines() {
        assert_eq!(parse_define("DEBUG"), ("DEBUG".to_string(), None));
        assert_eq!(
            parse_define("LEVEL=2"),
            ("LEVEL".to_string(), Some("2".to_string()))
        );
        assert_eq!(parse_define("EMPTY="), ("EMPTY".to_string(), Some(String::new())));
    }
}
