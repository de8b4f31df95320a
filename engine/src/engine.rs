use std::collections::HashSet;
use std::path::PathBuf;

use cranelift_codegen::isa::{OwnedTargetIsa, TargetIsa};
use cranelift_codegen::settings::{self, Configurable};
use frontend::{IntermediateModule, TargetLayout};
use parking_lot::Mutex;

use crate::archive::{ArchiveResolver, ImportArchiveDescriptor};
use crate::error::{LinkError, SessionError};
use crate::host::{HostResolver, HostSymbolDirectory, ProcessSymbols, StaticSymbols};
use crate::image::{ImageHeaderMode, PlatformShim};
use crate::library::LibraryResolver;
use crate::pool::{CompilePool, PoolSettings};
use crate::region::CodeRegion;
use crate::resolver::ResolverChain;
use crate::runtime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    fn as_str(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

pub struct EngineCreateInfo {
    pub pool: PoolSettings,
    pub opt_level: OptLevel,
    /// Run the IR verifier before code generation.
    pub verify: bool,
    pub image_header: ImageHeaderMode,
    /// Searched after the emulated-TLS runtime and before the process.
    pub host_symbols: Vec<Box<dyn HostSymbolDirectory>>,
    /// Fall back to every symbol the dynamic loader can see.
    pub search_process: bool,
    pub archives: Vec<PathBuf>,
    pub libraries: Vec<String>,
}

impl Default for EngineCreateInfo {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            opt_level: OptLevel::default(),
            verify: cfg!(debug_assertions),
            image_header: ImageHeaderMode::default(),
            host_symbols: Vec::new(),
            search_process: true,
            archives: Vec::new(),
            libraries: Vec::new(),
        }
    }
}

/// One compilation and execution session.
///
/// Constructed once by the application and passed by reference to whatever
/// needs to create regions.
pub struct LinkEngine {
    isa: OwnedTargetIsa,
    pool: CompilePool,
    resolvers: ResolverChain,
    archives: Vec<ImportArchiveDescriptor>,
    shim: Box<dyn PlatformShim>,
    live_regions: Mutex<HashSet<String>>,
}

impl LinkEngine {
    pub fn new(info: EngineCreateInfo) -> Result<Self, SessionError> {
        let isa = host_isa(info.opt_level, info.verify)?;
        log::info!("code generation target: {} ({})", isa.triple(), isa.name());

        let pool = CompilePool::new(info.pool).map_err(SessionError::WorkerPool)?;

        let mut directories: Vec<Box<dyn HostSymbolDirectory>> = Vec::new();
        directories.push(Box::new(
            runtime::runtime_symbols()
                .into_iter()
                .collect::<StaticSymbols>(),
        ));
        directories.extend(info.host_symbols);
        if info.search_process {
            match ProcessSymbols::new() {
                Ok(process) => directories.push(Box::new(process)),
                Err(err) => log::warn!("cannot search process symbols: {err}"),
            }
        }

        let archives = ArchiveResolver::open(&info.archives).map_err(SessionError::Archive)?;
        let descriptors: Vec<ImportArchiveDescriptor> = archives.descriptors().cloned().collect();

        let libraries = LibraryResolver::new();
        for library in descriptors
            .iter()
            .flat_map(|d| d.libraries.iter())
            .chain(&info.libraries)
        {
            libraries.add(library);
        }

        let resolvers = ResolverChain::new()
            .with(Box::new(HostResolver::new(directories)))
            .with(Box::new(archives))
            .with(Box::new(libraries));

        let shim = info.image_header.shim(&*isa);
        Ok(Self {
            isa,
            pool,
            resolvers,
            archives: descriptors,
            shim,
            live_regions: Mutex::new(HashSet::new()),
        })
    }

    pub fn isa(&self) -> &dyn TargetIsa {
        &*self.isa
    }

    pub(crate) fn owned_isa(&self) -> &OwnedTargetIsa {
        &self.isa
    }

    /// Type layout matching the generated code, for configuring a frontend.
    pub fn layout(&self) -> TargetLayout {
        TargetLayout::from_isa(&*self.isa)
    }

    pub fn resolvers(&self) -> &ResolverChain {
        &self.resolvers
    }

    pub fn archives(&self) -> &[ImportArchiveDescriptor] {
        &self.archives
    }

    pub(crate) fn pool(&self) -> &CompilePool {
        &self.pool
    }

    pub(crate) fn shim(&self) -> &dyn PlatformShim {
        &*self.shim
    }

    pub(crate) fn release_region(&self, name: &str) {
        self.live_regions.lock().remove(name);
    }

    pub fn live_regions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.live_regions.lock().iter().cloned().collect();
        names.sort();
        names
    }

    // ── Region operations ──

    pub fn create_code_region(&self, name: &str) -> Result<CodeRegion<'_>, LinkError> {
        if !self.live_regions.lock().insert(name.to_string()) {
            log::error!("code region '{name}' already exists");
            return Err(LinkError::DuplicateRegion(name.to_string()));
        }
        CodeRegion::create(self, name).inspect_err(|_| self.release_region(name))
    }

    pub fn add_module(
        &self,
        region: &mut CodeRegion<'_>,
        module: IntermediateModule,
    ) -> Result<(), LinkError> {
        debug_assert!(std::ptr::eq(region.engine(), self));
        region.add_module(module)
    }

    pub fn initialize(&self, region: &mut CodeRegion<'_>) -> Result<(), LinkError> {
        debug_assert!(std::ptr::eq(region.engine(), self));
        region.initialize()
    }

    pub fn lookup(&self, region: &mut CodeRegion<'_>, name: &str) -> Result<usize, LinkError> {
        debug_assert!(std::ptr::eq(region.engine(), self));
        region.lookup_address(name)
    }

    pub fn deinitialize(&self, region: &mut CodeRegion<'_>) -> Result<(), LinkError> {
        debug_assert!(std::ptr::eq(region.engine(), self));
        region.deinitialize()
    }

    pub fn destroy_code_region(&self, region: &mut CodeRegion<'_>) -> Result<(), LinkError> {
        debug_assert!(std::ptr::eq(region.engine(), self));
        region.destroy()
    }

    pub fn define_absolute_symbols<I, S>(
        &self,
        region: &mut CodeRegion<'_>,
        symbols: I,
    ) -> Result<(), LinkError>
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        debug_assert!(std::ptr::eq(region.engine(), self));
        region.define_absolute_symbols(symbols)
    }
}

/// The host target with the flags generated code needs: frame pointers and
/// unwind info so host unwinders can walk through it, and long-range
/// absolute relocations that the region's JIT patches at finalization.
fn host_isa(opt_level: OptLevel, verify: bool) -> Result<OwnedTargetIsa, SessionError> {
    let mut flags = settings::builder();
    flags.set("opt_level", opt_level.as_str())?;
    flags.set("enable_verifier", if verify { "true" } else { "false" })?;
    flags.set("preserve_frame_pointers", "true")?;
    flags.set("unwind_info", "true")?;
    flags.set("use_colocated_libcalls", "false")?;
    flags.set("is_pic", "false")?;

    let isa_builder =
        cranelift_native::builder().map_err(|msg| SessionError::HostDetection(msg.to_string()))?;
    Ok(isa_builder.finish(settings::Flags::new(flags))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> LinkEngine {
        LinkEngine::new(EngineCreateInfo {
            pool: PoolSettings {
                workers: 2,
                ..PoolSettings::default()
            },
            ..EngineCreateInfo::default()
        })
        .unwrap()
    }

    #[test]
    fn host_target_is_detected() {
        let engine = engine();
        let layout = engine.layout();
        assert_eq!(layout.pointer_bytes as usize, size_of::<usize>());
        assert_eq!(layout, TargetLayout::host());
        assert!(!engine.isa().flags().is_pic());
        assert!(engine.isa().flags().preserve_frame_pointers());
    }

    #[test]
    fn region_names_are_unique_among_live_regions() {
        let engine = engine();
        let mut first = engine.create_code_region("main").unwrap();
        assert!(matches!(
            engine.create_code_region("main"),
            Err(LinkError::DuplicateRegion(name)) if name == "main"
        ));
        assert_eq!(engine.live_regions(), ["main"]);
        assert_eq!(first.state(), crate::region::RegionState::Created);
        assert!(matches!(
            first.lookup_address("missing"),
            Err(LinkError::UndefinedSymbol { .. })
        ));
        engine.destroy_code_region(&mut first).unwrap();
        assert!(engine.live_regions().is_empty());
        let _again = engine.create_code_region("main").unwrap();
    }

    #[test]
    fn dropping_a_region_frees_its_name() {
        let engine = engine();
        {
            let _scoped = engine.create_code_region("scoped").unwrap();
        }
        assert!(engine.create_code_region("scoped").is_ok());
    }

    #[test]
    fn emulated_tls_runtime_is_bound_first() {
        let engine = engine();
        let refs = engine
            .resolvers()
            .resolve(&["__emutls_get_address".to_string()])
            .unwrap();
        assert_eq!(
            refs[0].address,
            Some(runtime::emutls_get_address as usize)
        );
    }

    #[test]
    fn missing_archive_is_a_session_error() {
        let result = LinkEngine::new(EngineCreateInfo {
            archives: vec![PathBuf::from("/nonexistent/hostjit-runtime.a")],
            ..EngineCreateInfo::default()
        });
        assert!(matches!(result, Err(SessionError::Archive(_))));
    }
}
