//! Source-to-module compilation.
//!
//! A `CompileFrontend` owns the language configuration of a session: the
//! predefined macros, header directories, the in-memory file layer and the
//! optional precompiled header applied to every compile.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::diagnostic::{DiagnosticEngine, DiagnosticSink, FatalError};
use crate::lower::ModuleLowerer;
use crate::module::IntermediateModule;
use crate::parser::Parser;
use crate::pch::{PchError, PrecompiledHeader};
use crate::preprocess::{PreprocessOutput, Preprocessor};
use crate::span::SourceFiles;
use crate::types::{TargetLayout, TargetOs};
use crate::vfs::{MemoryFileSystem, NativeFileSystem, OverlayFileSystem, normalize};

/// Routines over the host's emulated-TLS runtime, prepended to every
/// module. Lowered thread-local accesses call `__tls_get`; the module
/// finalizer calls `__tls_release`.
pub(crate) const TLS_PREAMBLE: &str = "\
extern \"C\" {
void *__emutls_get_address(void *control);
void __emutls_release(void *control);
static void *__tls_get(void *control) { return __emutls_get_address(control); }
static void __tls_release(void *control) { __emutls_release(control); }
}
";

const PREAMBLE_PATH: &str = "<hostjit-preamble>";
const PCH_SOURCE_PATH: &str = "<precompiled-header>";
const BUILTIN_FILE: &str = "<built-in>";

#[derive(Debug, Clone)]
pub struct FrontendCreateInfo {
    /// Searched in order by `#include`.
    pub include_dirs: Vec<PathBuf>,
    /// Extra macros; `None` defines the name as `1`.
    pub defines: Vec<(String, Option<String>)>,
    pub layout: TargetLayout,
    /// Defines `NDEBUG`.
    pub release: bool,
    /// Cache produced by an earlier `generate_precompiled_header`.
    pub implicit_header: Option<PathBuf>,
}

impl Default for FrontendCreateInfo {
    fn default() -> Self {
        Self {
            include_dirs: Vec::new(),
            defines: Vec::new(),
            layout: TargetLayout::host(),
            release: !cfg!(debug_assertions),
            implicit_header: None,
        }
    }
}

struct ImplicitHeader {
    path: PathBuf,
    header: PrecompiledHeader,
    typedefs: Vec<String>,
}

pub struct CompileFrontend {
    info: FrontendCreateInfo,
    sink: Arc<dyn DiagnosticSink>,
    memory: Arc<MemoryFileSystem>,
    fs: OverlayFileSystem,
    header: Option<ImplicitHeader>,
}

impl CompileFrontend {
    pub fn new(info: FrontendCreateInfo, sink: Arc<dyn DiagnosticSink>) -> Result<Self, PchError> {
        let memory = Arc::new(MemoryFileSystem::new());
        let mut fs = OverlayFileSystem::new(Arc::new(NativeFileSystem));
        fs.push_overlay(memory.clone());
        let mut frontend = Self {
            info,
            sink,
            memory,
            fs,
            header: None,
        };
        if let Some(path) = frontend.info.implicit_header.clone() {
            frontend.set_implicit_header(&path)?;
        }
        Ok(frontend)
    }

    pub fn layout(&self) -> TargetLayout {
        self.info.layout
    }

    /// Place an in-memory file where `#include` can find it.
    pub fn add_virtual_file(&mut self, path: impl AsRef<Path>, text: &str) {
        self.memory.write(path, text);
    }

    /// Apply a header cache from an earlier run to every later compile.
    pub fn set_implicit_header(&mut self, path: &Path) -> Result<(), PchError> {
        let header = PrecompiledHeader::load(path)?;
        log::info!(
            "using precompiled header {} ({} declarations)",
            path.display(),
            header.items.len()
        );
        self.attach(path, header);
        Ok(())
    }

    pub fn implicit_header(&self) -> Option<&Path> {
        self.header.as_ref().map(|h| h.path.as_path())
    }

    fn attach(&mut self, path: &Path, header: PrecompiledHeader) {
        let typedefs = header.typedef_names();
        self.info.implicit_header = Some(path.to_path_buf());
        self.header = Some(ImplicitHeader {
            path: path.to_path_buf(),
            header,
            typedefs,
        });
    }

    /// Compile one translation unit. Returns an empty module when an
    /// error or fatal diagnostic was reported.
    pub fn compile(&mut self, source: &str, module_name: &str) -> IntermediateModule {
        let path = module_path(module_name);
        self.memory.write(&path, source);

        let files = match &self.header {
            Some(implicit) => implicit.header.files.clone(),
            None => SourceFiles::new(),
        };
        let sink = self.sink.clone();
        let mut diag = DiagnosticEngine::with_files(&*sink, files);

        let Ok(output) = self.preprocess(&mut diag, &path, source) else {
            log::debug!("compile of {module_name} stopped by a fatal diagnostic");
            return IntermediateModule::empty(module_name);
        };

        let mut parser = Parser::new(output.tokens, &mut diag);
        if let Some(implicit) = &self.header {
            for name in &implicit.typedefs {
                parser.declare_typedef(name);
            }
        }
        let unit = parser.parse_translation_unit();
        if diag.has_failed() {
            return IntermediateModule::empty(module_name);
        }

        let mut libraries = Vec::new();
        let mut lowerer = ModuleLowerer::new(&mut diag, self.info.layout, module_name);
        if let Some(implicit) = &self.header {
            lowerer.lower_header(&implicit.header.items);
            libraries.extend(implicit.header.libraries.iter().cloned());
        }
        lowerer.lower_items(&unit.items);
        for library in output.libraries {
            if !libraries.contains(&library) {
                libraries.push(library);
            }
        }
        let contents = lowerer.finish(libraries);

        if diag.has_failed() {
            log::debug!(
                "compile of {module_name} failed with {} error(s)",
                diag.error_count()
            );
            return IntermediateModule::empty(module_name);
        }
        log::debug!(
            "compiled {module_name}: {} symbols, {} functions, {} data objects",
            contents.symbols.len(),
            contents.functions.len(),
            contents.data.len()
        );
        IntermediateModule::new(module_name, contents)
    }

    fn preprocess(
        &self,
        diag: &mut DiagnosticEngine<'_>,
        path: &Path,
        source: &str,
    ) -> Result<PreprocessOutput, FatalError> {
        let mut pp = Preprocessor::new(&self.fs, &self.info.include_dirs, diag);
        self.predefine(&mut pp);
        if let Some(implicit) = &self.header {
            for def in &implicit.header.macros {
                pp.define(def.clone());
            }
        }
        pp.process_text(Path::new(PREAMBLE_PATH), TLS_PREAMBLE)?;
        pp.process_text(path, source)?;
        let (output, _) = pp.finish();
        if let Some(implicit) = &self.header {
            diag.remark(
                None,
                format!("using precompiled header '{}'", implicit.path.display()),
            );
        }
        Ok(output)
    }

    fn predefine(&self, pp: &mut Preprocessor<'_, '_>) {
        let layout = &self.info.layout;
        pp.define_text("__cplusplus", "202302L");
        pp.define_text("__cpp_exceptions", "199711L");
        pp.define_text("__HOSTJIT__", "1");
        pp.define_text("__SIZEOF_POINTER__", &layout.pointer_bytes.to_string());
        pp.define_text("__SIZEOF_LONG__", &(layout.long_bits / 8).to_string());
        if layout.pointer_bytes == 8 && layout.long_bits == 64 {
            pp.define_text("__LP64__", "1");
        }

        if cfg!(target_arch = "x86_64") {
            pp.define_text("__x86_64__", "1");
            pp.define_text("__x86_64", "1");
        } else if cfg!(target_arch = "aarch64") {
            pp.define_text("__aarch64__", "1");
        } else if cfg!(target_arch = "riscv64") {
            pp.define_text("__riscv", "1");
        }

        match layout.os {
            TargetOs::Linux => {
                pp.define_text("__linux__", "1");
                pp.define_text("__unix__", "1");
            }
            TargetOs::MacOs => {
                pp.define_text("__APPLE__", "1");
                pp.define_text("__MACH__", "1");
            }
            TargetOs::Windows => {
                pp.define_text("_WIN32", "1");
                if layout.pointer_bytes == 8 {
                    pp.define_text("_WIN64", "1");
                }
                if cfg!(target_arch = "x86_64") {
                    pp.define_text("_M_X64", "100");
                } else if cfg!(target_arch = "aarch64") {
                    pp.define_text("_M_ARM64", "1");
                }
            }
            TargetOs::Other => {}
        }

        if self.info.release {
            pp.define_text("NDEBUG", "1");
        }
        for (name, value) in &self.info.defines {
            pp.define_text(name, value.as_deref().unwrap_or("1"));
        }
    }

    /// Preprocess, parse and check `source` as a header, write the cache
    /// to `output` and apply it to every later compile. On failure nothing
    /// is written and the frontend is left as it was.
    pub fn generate_precompiled_header(
        &mut self,
        source: &str,
        output: &Path,
    ) -> Result<(), PchError> {
        let sink = self.sink.clone();
        let mut diag = DiagnosticEngine::new(&*sink);

        let preprocessed = {
            let mut pp = Preprocessor::new(&self.fs, &self.info.include_dirs, &mut diag);
            self.predefine(&mut pp);
            match pp.process_text(Path::new(PCH_SOURCE_PATH), source) {
                Ok(()) => Some(pp.finish()),
                Err(FatalError) => None,
            }
        };
        let Some((pp_output, macros)) = preprocessed else {
            return Err(PchError::CompileFailed);
        };

        let unit = Parser::new(pp_output.tokens, &mut diag).parse_translation_unit();
        if !diag.has_failed() {
            let mut checker = ModuleLowerer::new(&mut diag, self.info.layout, "precompiled-header");
            checker.lower_header(&unit.items);
            let _ = checker.finish(Vec::new());
        }
        if diag.has_failed() {
            log::error!("precompiled header has errors; no cache written");
            return Err(PchError::CompileFailed);
        }

        let files = diag.into_files();
        let builtin = files.names().iter().position(|name| name == BUILTIN_FILE);
        let header = PrecompiledHeader {
            macros: macros
                .into_iter()
                .filter(|def| Some(def.span.file.0 as usize) != builtin)
                .collect(),
            files,
            items: unit.items,
            libraries: pp_output.libraries,
        };
        header.save(output)?;
        log::info!(
            "wrote precompiled header {} ({} declarations, {} macros)",
            output.display(),
            header.items.len(),
            header.macros.len()
        );
        self.attach(output, header);
        Ok(())
    }
}

/// Virtual path of a module's source.
fn module_path(module_name: &str) -> PathBuf {
    let path = normalize(Path::new(module_name));
    if path.extension().is_some() {
        path
    } else {
        path.with_extension("cpp")
    }
}

/// A frontend shared between threads; compiles are serialized.
pub struct SharedFrontend {
    inner: Mutex<CompileFrontend>,
}

impl SharedFrontend {
    pub fn new(frontend: CompileFrontend) -> Self {
        Self {
            inner: Mutex::new(frontend),
        }
    }

    pub fn compile(&self, source: &str, module_name: &str) -> IntermediateModule {
        self.inner.lock().compile(source, module_name)
    }

    pub fn lock(&self) -> MutexGuard<'_, CompileFrontend> {
        self.inner.lock()
    }

    pub fn into_inner(self) -> CompileFrontend {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::{CollectingSink, Severity};
    use crate::module::SymbolLinkage;
    use tempdir::TempDir;

    fn frontend(info: FrontendCreateInfo) -> (CompileFrontend, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        let frontend = CompileFrontend::new(info, sink.clone()).unwrap();
        (frontend, sink)
    }

    #[test]
    fn compiles_a_module() {
        let (mut fe, sink) = frontend(FrontendCreateInfo::default());
        let module = fe.compile("extern \"C\" int add(int a, int b) { return a + b; }\n", "demo");
        assert!(!module.is_empty(), "{:?}", sink.snapshot());
        let contents = module.contents().unwrap();
        assert_eq!(
            contents.symbol("add").map(|s| s.linkage),
            Some(SymbolLinkage::Export)
        );
        // Preamble routines stay private.
        assert_eq!(
            contents.symbol("__tls_get").map(|s| s.linkage),
            Some(SymbolLinkage::Local)
        );
    }

    #[test]
    fn errors_yield_empty_module() {
        let (mut fe, sink) = frontend(FrontendCreateInfo::default());
        let module = fe.compile("int f() { return undefined_name; }\n", "broken");
        assert!(module.is_empty());
        assert!(sink.contains(Severity::Error, "use of undeclared identifier"));
        let errors: Vec<_> = sink
            .snapshot()
            .into_iter()
            .filter(|d| d.severity == Severity::Error)
            .collect();
        let location = errors[0].location.as_ref().unwrap();
        assert_eq!(location.file, "broken.cpp");
        assert_eq!(location.line, 1);
    }

    #[test]
    fn same_module_name_recompiles() {
        let (mut fe, _) = frontend(FrontendCreateInfo::default());
        assert!(fe.compile("int broken(", "again").is_empty());
        assert!(!fe.compile("int fixed() { return 1; }", "again").is_empty());
    }

    #[test]
    fn predefined_macros() {
        let (mut fe, sink) = frontend(FrontendCreateInfo {
            defines: vec![("ANSWER".into(), Some("42".into())), ("FLAG".into(), None)],
            release: true,
            ..Default::default()
        });
        let module = fe.compile(
            "#if __cplusplus != 202302L || !defined(__cpp_exceptions)\n#error wrong language\n#endif\n\
             #if !defined(NDEBUG) || FLAG != 1\n#error wrong build\n#endif\n\
             int answer() { return ANSWER + (int)sizeof(void *) - __SIZEOF_POINTER__; }\n",
            "macros",
        );
        assert!(!module.is_empty(), "{:?}", sink.snapshot());
    }

    #[test]
    fn virtual_includes() {
        let (mut fe, sink) = frontend(FrontendCreateInfo {
            include_dirs: vec![PathBuf::from("virtual/include")],
            ..Default::default()
        });
        fe.add_virtual_file("virtual/include/util.h", "#pragma once\ninline int twice(int x) { return 2 * x; }\n");
        let module = fe.compile(
            "#include <util.h>\n#include \"util.h\"\nint four() { return twice(2); }\n",
            "includes",
        );
        assert!(!module.is_empty(), "{:?}", sink.snapshot());
    }

    #[test]
    fn missing_include_is_fatal() {
        let (mut fe, sink) = frontend(FrontendCreateInfo::default());
        let module = fe.compile("#include \"nowhere.h\"\nint x;\n", "missing");
        assert!(module.is_empty());
        assert_eq!(sink.count(Severity::Fatal), 1);
    }

    #[test]
    fn precompiled_header_applies_to_later_compiles() {
        let dir = TempDir::new("hostjit-frontend").unwrap();
        let path = dir.path().join("prelude.pch");
        let (mut fe, sink) = frontend(FrontendCreateInfo::default());
        fe.generate_precompiled_header(
            "typedef unsigned long word;\n#define SCALE 3\ninline word scale(word x) { return x * SCALE; }\n",
            &path,
        )
        .unwrap();
        assert!(path.exists());
        assert_eq!(fe.implicit_header(), Some(path.as_path()));

        let module = fe.compile("word nine() { return scale(SCALE); }\n", "user");
        assert!(!module.is_empty(), "{:?}", sink.snapshot());
        assert!(sink.contains(Severity::Remark, "using precompiled header"));

        // A fresh frontend can attach the same cache.
        let (mut other, _) = frontend(FrontendCreateInfo {
            implicit_header: Some(path.clone()),
            ..Default::default()
        });
        assert!(!other.compile("word one() { return 1; }", "user").is_empty());
    }

    #[test]
    fn failing_header_writes_nothing() {
        let dir = TempDir::new("hostjit-frontend").unwrap();
        let path = dir.path().join("broken.pch");
        let (mut fe, _) = frontend(FrontendCreateInfo::default());
        let result = fe.generate_precompiled_header("int broken(;\n", &path);
        assert!(matches!(result, Err(PchError::CompileFailed)));
        assert!(!path.exists());
        assert!(fe.implicit_header().is_none());
    }
}
