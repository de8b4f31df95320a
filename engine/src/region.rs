//! Code regions: isolated namespaces of lazily compiled code.
//!
//! Adding a module only declares its symbols and defines its data. Function
//! bodies wait as IR until a lookup needs them; the lookup then compiles
//! the requested function together with everything it transitively
//! references, binds the imports of that closure through the resolver
//! chain, and finalizes the region.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::mem;
use std::sync::Arc;

use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::{Context, FinalizedMachReloc};
use cranelift_codegen::ir::{self, UserExternalName};
use cranelift_codegen::isa::{OwnedTargetIsa, TargetIsa};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{
    DataDescription, DataId, FuncId, Linkage, Module, default_libcall_names,
};
use frontend::{
    DATA_NAMESPACE, DataContents, FUNCTION_NAMESPACE, IntermediateModule, ModuleContents,
    SymbolKind, SymbolLinkage, TLS_CONTROL_PREFIX,
};
use parking_lot::RwLock;

use crate::engine::LinkEngine;
use crate::error::LinkError;
use crate::image::RegionData;
use crate::library::LibraryResolver;
use crate::runtime::{self, EmutlsControl};
use crate::resolver::{ResolverStage, SymbolReference};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Created,
    ModulesAdded,
    Initialized,
    Deinitialized,
    Destroyed,
    /// A link failure happened; only destruction is left.
    Failed,
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RegionState::Created => "created",
            RegionState::ModulesAdded => "holding modules",
            RegionState::Initialized => "initialized",
            RegionState::Deinitialized => "deinitialized",
            RegionState::Destroyed => "destroyed",
            RegionState::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SymbolId {
    Func(FuncId),
    Data(DataId),
}

struct PendingFunction {
    name: String,
    function: ir::Function,
    references: Vec<SymbolId>,
}

struct CompiledFunction {
    id: FuncId,
    function: ir::Function,
    bytes: Vec<u8>,
    alignment: u64,
    relocs: Vec<FinalizedMachReloc>,
}

/// Static initialization entry points of one added module.
struct LoadedModule {
    name: String,
    initializer: Option<FuncId>,
    finalizer: Option<FuncId>,
    constructors: Vec<FuncId>,
    destructors: Vec<FuncId>,
}

/// Everything that is released together with the region.
struct RegionLinker {
    module: JITModule,
    isa: OwnedTargetIsa,
    /// Addresses the JIT may use for imports, shared with its lookup hook.
    bindings: Arc<RwLock<HashMap<String, usize>>>,
    names: HashMap<SymbolId, String>,
    exports: HashMap<String, SymbolId>,
    defined: HashSet<SymbolId>,
    pending: HashMap<FuncId, PendingFunction>,
    /// Targets of data relocations defined since the last finalize.
    data_references: Vec<SymbolId>,
    unfinalized: bool,
    modules: Vec<LoadedModule>,
    references: Vec<SymbolReference>,
    libraries: Vec<String>,
    /// Libraries this region's modules asked for, searched after the chain.
    region_libraries: LibraryResolver,
    /// Thread-local control blocks defined since the last finalize.
    new_tls_controls: Vec<DataId>,
    /// Finalized control blocks whose slots are released on destroy.
    tls_controls: Vec<DataId>,
}

impl RegionLinker {
    fn new(isa: OwnedTargetIsa) -> Self {
        let bindings = Arc::new(RwLock::new(HashMap::<String, usize>::new()));
        let mut builder = JITBuilder::with_isa(Arc::clone(&isa), default_libcall_names());
        let lookup = Arc::clone(&bindings);
        builder.symbol_lookup_fn(Box::new(move |name| {
            lookup.read().get(name).map(|address| *address as *const u8)
        }));
        Self {
            module: JITModule::new(builder),
            isa,
            bindings,
            names: HashMap::new(),
            exports: HashMap::new(),
            defined: HashSet::new(),
            pending: HashMap::new(),
            data_references: Vec::new(),
            unfinalized: false,
            modules: Vec::new(),
            references: Vec::new(),
            libraries: Vec::new(),
            region_libraries: LibraryResolver::new(),
            new_tls_controls: Vec::new(),
            tls_controls: Vec::new(),
        }
    }

    fn declare(
        &mut self,
        region: &str,
        name: &str,
        kind: &SymbolKind,
        linkage: Linkage,
    ) -> Result<SymbolId, LinkError> {
        if linkage == Linkage::Export {
            let absolute = self
                .references
                .iter()
                .any(|r| r.name == name && r.stage == Some(ResolverStage::Absolute));
            if self.exports.contains_key(name) || absolute {
                return Err(LinkError::DuplicateSymbol {
                    region: region.to_string(),
                    name: name.to_string(),
                });
            }
        }
        let id = match kind {
            SymbolKind::Function(signature) => {
                SymbolId::Func(self.module.declare_function(name, linkage, signature)?)
            }
            SymbolKind::Data { writable } => {
                SymbolId::Data(self.module.declare_data(name, linkage, *writable, false)?)
            }
        };
        self.names.entry(id).or_insert_with(|| name.to_string());
        if linkage == Linkage::Export {
            self.exports.insert(name.to_string(), id);
        }
        Ok(id)
    }

    fn add(&mut self, region: &str, module_name: &str, contents: ModuleContents) -> Result<(), LinkError> {
        let ordinal = self.modules.len();
        let mut ids = Vec::with_capacity(contents.symbols.len());
        for symbol in &contents.symbols {
            let id = match symbol.linkage {
                SymbolLinkage::Import => {
                    self.declare(region, &symbol.name, &symbol.kind, Linkage::Import)?
                }
                // locals of different modules must not meet
                SymbolLinkage::Local => self.declare(
                    region,
                    &format!("{}${ordinal}", symbol.name),
                    &symbol.kind,
                    Linkage::Local,
                )?,
                SymbolLinkage::Export => {
                    self.declare(region, &symbol.name, &symbol.kind, Linkage::Export)?
                }
            };
            ids.push(id);
        }
        let func_id = |symbol: usize| match ids.get(symbol) {
            Some(SymbolId::Func(id)) => Ok(*id),
            _ => Err(LinkError::Codegen {
                function: format!("{module_name}#{symbol}"),
                message: "symbol is not a function".into(),
            }),
        };

        for body in contents.functions {
            let id = func_id(body.symbol)?;
            let name = contents.symbols[body.symbol].name.clone();
            let mut function = body.function;
            let references = remap_external_names(&mut function, &ids).ok_or_else(|| {
                LinkError::Codegen {
                    function: name.clone(),
                    message: "reference to an unknown symbol".into(),
                }
            })?;
            self.pending.insert(
                id,
                PendingFunction {
                    name,
                    function,
                    references,
                },
            );
        }

        for data in contents.data {
            let Some(SymbolId::Data(id)) = ids.get(data.symbol).copied() else {
                return Err(LinkError::Codegen {
                    function: format!("{module_name}#{}", data.symbol),
                    message: "symbol is not a data object".into(),
                });
            };
            let mut description = DataDescription::new();
            match data.contents {
                DataContents::Bytes(bytes) => description.define(bytes.into_boxed_slice()),
                DataContents::Zeroed(len) => description.define_zeroinit(len),
            }
            description.set_align(data.align.max(1));
            for relocation in &data.relocations {
                match ids.get(relocation.symbol).copied() {
                    Some(SymbolId::Func(target)) if relocation.addend == 0 => {
                        let func = self.module.declare_func_in_data(target, &mut description);
                        description.write_function_addr(relocation.offset, func);
                        self.data_references.push(SymbolId::Func(target));
                    }
                    Some(SymbolId::Data(target)) => {
                        let global = self.module.declare_data_in_data(target, &mut description);
                        description.write_data_addr(relocation.offset, global, relocation.addend);
                        self.data_references.push(SymbolId::Data(target));
                    }
                    _ => {
                        return Err(LinkError::relocation(
                            module_name,
                            format!("unsupported data relocation at offset {}", relocation.offset),
                        ));
                    }
                }
            }
            self.module.define_data(id, &description)?;
            self.defined.insert(SymbolId::Data(id));
            if contents.symbols[data.symbol].name.starts_with(TLS_CONTROL_PREFIX) {
                self.new_tls_controls.push(id);
            }
            self.unfinalized = true;
        }

        let list = |symbols: &[usize]| symbols.iter().map(|s| func_id(*s)).collect::<Result<Vec<_>, _>>();
        let loaded = LoadedModule {
            name: module_name.to_string(),
            initializer: contents.initializer.map(func_id).transpose()?,
            finalizer: contents.finalizer.map(func_id).transpose()?,
            constructors: list(&contents.constructors)?,
            destructors: list(&contents.destructors)?,
        };
        self.modules.push(loaded);
        for library in contents.libraries {
            if !self.libraries.contains(&library) {
                self.region_libraries.add(&library);
                self.libraries.push(library);
            }
        }
        Ok(())
    }

    /// Functions that must be compiled and imports that must be bound
    /// before `root` (and any data waiting for finalization) can be used.
    fn closure(&self, root: SymbolId) -> (Vec<FuncId>, Vec<String>) {
        let mut stack = vec![root];
        stack.extend(self.data_references.iter().copied());
        let mut seen = HashSet::new();
        let mut compile = Vec::new();
        let mut imports = Vec::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let SymbolId::Func(func) = id {
                if let Some(pending) = self.pending.get(&func) {
                    compile.push(func);
                    stack.extend(pending.references.iter().copied());
                    continue;
                }
            }
            if self.defined.contains(&id) {
                continue;
            }
            if let Some(name) = self.names.get(&id) {
                imports.push(name.clone());
            }
        }
        (compile, imports)
    }

    /// Gives the slots of this region's thread-local variables back to the
    /// runtime.
    fn release_thread_locals(&self) {
        let controls: Vec<*const EmutlsControl> = self
            .tls_controls
            .iter()
            .map(|id| self.module.get_finalized_data(*id).0.cast())
            .collect();
        // SAFETY: the blocks are finalized and live until the memory is
        // freed right after; no code of the region runs again
        unsafe { runtime::release_slots(&controls) };
    }

    fn address(&self, id: SymbolId) -> usize {
        match id {
            SymbolId::Func(func) => self.module.get_finalized_function(func) as usize,
            SymbolId::Data(data) => self.module.get_finalized_data(data).0 as usize,
        }
    }
}

impl RegionData for RegionLinker {
    fn isa(&self) -> &dyn TargetIsa {
        &*self.isa
    }

    fn define_data(
        &mut self,
        name: &str,
        bytes: Vec<u8>,
        align: u64,
        self_pointers: &[u32],
    ) -> Result<(), LinkError> {
        let id = self.module.declare_data(name, Linkage::Export, false, false)?;
        let mut description = DataDescription::new();
        description.define(bytes.into_boxed_slice());
        description.set_align(align);
        for offset in self_pointers {
            let global = self.module.declare_data_in_data(id, &mut description);
            description.write_data_addr(*offset, global, 0);
        }
        self.module.define_data(id, &description)?;
        self.names.insert(SymbolId::Data(id), name.to_string());
        self.exports.insert(name.to_string(), SymbolId::Data(id));
        self.defined.insert(SymbolId::Data(id));
        self.unfinalized = true;
        Ok(())
    }
}

/// Rewrites the module-local symbol indices in `function`'s external names
/// to region ids and returns the referenced ids.
fn remap_external_names(function: &mut ir::Function, ids: &[SymbolId]) -> Option<Vec<SymbolId>> {
    let named: Vec<_> = function
        .params
        .user_named_funcs()
        .iter()
        .map(|(reference, name)| (reference, name.clone()))
        .collect();
    let mut references = Vec::with_capacity(named.len());
    for (reference, name) in named {
        let id = *ids.get(name.index as usize)?;
        let renamed = match (name.namespace, id) {
            (FUNCTION_NAMESPACE, SymbolId::Func(func)) => {
                UserExternalName::new(FUNCTION_NAMESPACE, func.as_u32())
            }
            (DATA_NAMESPACE, SymbolId::Data(data)) => {
                UserExternalName::new(DATA_NAMESPACE, data.as_u32())
            }
            _ => return None,
        };
        function.params.reset_user_func_name(reference, renamed);
        references.push(id);
    }
    Some(references)
}

fn compile_function(
    isa: &dyn TargetIsa,
    id: FuncId,
    pending: PendingFunction,
) -> Result<CompiledFunction, LinkError> {
    let PendingFunction { name, function, .. } = pending;
    let mut ctx = Context::for_function(function);
    let (bytes, alignment, relocs) = {
        let code = ctx
            .compile(isa, &mut ControlPlane::default())
            .map_err(|err| LinkError::Codegen {
                function: name.clone(),
                message: err.inner.to_string(),
            })?;
        (
            code.code_buffer().to_vec(),
            code.buffer.alignment as u64,
            code.buffer.relocs().to_vec(),
        )
    };
    log::debug!("compiled '{name}' ({} bytes)", bytes.len());
    Ok(CompiledFunction {
        id,
        function: ctx.func,
        bytes,
        alignment,
        relocs,
    })
}

// ══════════════════════════════════════════════════════════════════════
// Handle
// ══════════════════════════════════════════════════════════════════════

/// Owning handle of one region. Not `Clone`; dropping it destroys the
/// region. Addresses it returns may be shared freely until then.
pub struct CodeRegion<'e> {
    engine: &'e LinkEngine,
    name: String,
    state: RegionState,
    linker: Option<RegionLinker>,
}

impl<'e> CodeRegion<'e> {
    pub(crate) fn create(engine: &'e LinkEngine, name: &str) -> Result<Self, LinkError> {
        let mut linker = RegionLinker::new(Arc::clone(engine.owned_isa()));
        engine.shim().prepare_region(&mut linker)?;
        log::info!("created code region '{name}' ({} shim)", engine.shim().name());
        Ok(Self {
            engine,
            name: name.to_string(),
            state: RegionState::Created,
            linker: Some(linker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RegionState {
        self.state
    }

    pub fn engine(&self) -> &'e LinkEngine {
        self.engine
    }

    /// The linker if the region may still be used for `operation`.
    fn usable(
        &mut self,
        operation: &'static str,
        allowed: &[RegionState],
    ) -> Result<&mut RegionLinker, LinkError> {
        match self.state {
            RegionState::Destroyed => return Err(LinkError::RegionDestroyed(self.name.clone())),
            RegionState::Failed => return Err(LinkError::RegionFailed(self.name.clone())),
            state if !allowed.contains(&state) => {
                return Err(LinkError::InvalidState {
                    region: self.name.clone(),
                    operation,
                    state,
                });
            }
            _ => {}
        }
        self.linker
            .as_mut()
            .ok_or_else(|| LinkError::RegionDestroyed(self.name.clone()))
    }

    fn track<T>(&mut self, result: Result<T, LinkError>) -> Result<T, LinkError> {
        if let Err(err) = &result {
            log::error!("region '{}': {err}", self.name);
            if err.is_link_failure() {
                self.state = RegionState::Failed;
            }
        }
        result
    }

    /// Declares the module's symbols and defines its data. Function bodies
    /// are compiled on first use.
    pub fn add_module(&mut self, module: IntermediateModule) -> Result<(), LinkError> {
        let region = self.name.clone();
        let linker = self.usable(
            "add a module to",
            &[RegionState::Created, RegionState::ModulesAdded],
        )?;
        let module_name = module.name.clone();
        let Some(contents) = module.into_contents() else {
            return Err(LinkError::EmptyModule(module_name));
        };
        let result = linker.add(&region, &module_name, contents);
        self.track(result)?;
        self.state = RegionState::ModulesAdded;
        log::info!("added module '{module_name}' to region '{region}'");
        Ok(())
    }

    /// Binds names in this region ahead of the resolver chain.
    pub fn define_absolute_symbols<I, S>(&mut self, symbols: I) -> Result<(), LinkError>
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let region = self.name.clone();
        let linker = self.usable(
            "define absolute symbols in",
            &[RegionState::Created, RegionState::ModulesAdded],
        )?;
        let mut result = Ok(());
        for (name, address) in symbols {
            let name = name.into();
            if linker.exports.contains_key(&name) || linker.bindings.read().contains_key(&name) {
                result = Err(LinkError::DuplicateSymbol {
                    region: region.clone(),
                    name,
                });
                break;
            }
            linker.bindings.write().insert(name.clone(), address);
            linker
                .references
                .push(SymbolReference::bound(name, ResolverStage::Absolute, address));
        }
        self.track(result)
    }

    /// Address of an exported symbol. Compiles whatever it still needs on
    /// the engine's worker pool and blocks until that is done; there is no
    /// way to cancel this once started.
    pub fn lookup_address(&mut self, name: &str) -> Result<usize, LinkError> {
        let region = self.name.clone();
        let engine = self.engine;
        let linker = self.usable(
            "look up symbols in",
            &[
                RegionState::Created,
                RegionState::ModulesAdded,
                RegionState::Initialized,
                RegionState::Deinitialized,
            ],
        )?;
        let Some(id) = linker.exports.get(name).copied() else {
            return Err(LinkError::UndefinedSymbol {
                region,
                name: name.to_string(),
            });
        };
        let result = materialize(engine, &region, linker, id);
        self.track(result)
    }

    pub fn lookup<T>(&mut self, name: &str) -> Result<*const T, LinkError> {
        self.lookup_address(name).map(|address| address as *const T)
    }

    fn function_address(&mut self, id: FuncId) -> Result<usize, LinkError> {
        let region = self.name.clone();
        let engine = self.engine;
        let Some(linker) = self.linker.as_mut() else {
            return Err(LinkError::RegionDestroyed(region));
        };
        let result = materialize(engine, &region, linker, SymbolId::Func(id));
        self.track(result)
    }

    /// Runs every module's static initializer and constructors in the
    /// order the modules were added.
    pub fn initialize(&mut self) -> Result<(), LinkError> {
        let linker = self.usable(
            "initialize",
            &[RegionState::ModulesAdded, RegionState::Deinitialized],
        )?;
        let order: Vec<(String, FuncId)> = linker
            .modules
            .iter()
            .flat_map(|m| {
                m.initializer
                    .iter()
                    .chain(&m.constructors)
                    .map(|id| (m.name.clone(), *id))
            })
            .collect();
        for (module, id) in order {
            let address = self.function_address(id)?;
            log::debug!("running initializer of '{module}' at {address:#x}");
            // SAFETY: initializers and constructors are `void()` functions
            // compiled for the host calling convention
            unsafe { call_void(address) };
        }
        self.state = RegionState::Initialized;
        log::info!("initialized region '{}'", self.name);
        Ok(())
    }

    /// Runs destructors and static finalizers in reverse module order.
    pub fn deinitialize(&mut self) -> Result<(), LinkError> {
        let linker = self.usable("deinitialize", &[RegionState::Initialized])?;
        let order: Vec<(String, FuncId)> = linker
            .modules
            .iter()
            .rev()
            .flat_map(|m| {
                m.destructors
                    .iter()
                    .rev()
                    .chain(&m.finalizer)
                    .map(|id| (m.name.clone(), *id))
            })
            .collect();
        for (module, id) in order {
            let address = self.function_address(id)?;
            log::debug!("running finalizer of '{module}' at {address:#x}");
            // SAFETY: as in `initialize`
            unsafe { call_void(address) };
        }
        self.state = RegionState::Deinitialized;
        log::info!("deinitialized region '{}'", self.name);
        Ok(())
    }

    /// Releases the region's memory. Every address it handed out becomes
    /// invalid; later operations fail with `RegionDestroyed`.
    pub fn destroy(&mut self) -> Result<(), LinkError> {
        if self.state == RegionState::Destroyed {
            return Err(LinkError::RegionDestroyed(self.name.clone()));
        }
        if let Some(linker) = self.linker.take() {
            linker.release_thread_locals();
            // SAFETY: the handle is the only owner of the region's code and
            // callers were told addresses die with it
            unsafe { linker.module.free_memory() };
        }
        self.engine.release_region(&self.name);
        self.state = RegionState::Destroyed;
        log::info!("destroyed code region '{}'", self.name);
        Ok(())
    }

    /// Every name bound for this region and the stage that bound it.
    pub fn symbol_references(&self) -> &[SymbolReference] {
        self.linker
            .as_ref()
            .map(|l| l.references.as_slice())
            .unwrap_or_default()
    }

    /// Libraries requested with `#pragma comment(lib, ...)`.
    pub fn dependent_libraries(&self) -> &[String] {
        self.linker
            .as_ref()
            .map(|l| l.libraries.as_slice())
            .unwrap_or_default()
    }

    pub fn module_names(&self) -> Vec<&str> {
        self.linker
            .as_ref()
            .map(|l| l.modules.iter().map(|m| m.name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Functions still waiting for code generation.
    pub fn pending_functions(&self) -> usize {
        self.linker.as_ref().map_or(0, |l| l.pending.len())
    }
}

impl Drop for CodeRegion<'_> {
    fn drop(&mut self) {
        if self.state != RegionState::Destroyed {
            let _ = self.destroy();
        }
    }
}

impl fmt::Debug for CodeRegion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeRegion")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish()
    }
}

/// # Safety
/// `address` must be a `void()` function for the host calling convention.
unsafe fn call_void(address: usize) {
    // SAFETY: forwarded contract
    let function = unsafe { mem::transmute::<usize, extern "C" fn()>(address) };
    function();
}

/// Compiles the closure of `root` on the pool, binds its imports and
/// finalizes the region.
fn materialize(
    engine: &LinkEngine,
    region: &str,
    linker: &mut RegionLinker,
    root: SymbolId,
) -> Result<usize, LinkError> {
    let (compile, imports) = linker.closure(root);
    if compile.is_empty() && imports.is_empty() && !linker.unfinalized {
        return Ok(linker.address(root));
    }

    let unbound: Vec<String> = {
        let bindings = linker.bindings.read();
        imports
            .into_iter()
            .filter(|name| !bindings.contains_key(name))
            .collect()
    };
    if !unbound.is_empty() {
        let mut references = engine.resolvers().resolve(&unbound)?;
        let mut missing = Vec::new();
        {
            let mut bindings = linker.bindings.write();
            for reference in &mut references {
                if reference.address.is_none() {
                    if let Some(address) = linker.region_libraries.lookup(&reference.name) {
                        *reference = SymbolReference::bound(
                            reference.name.as_str(),
                            ResolverStage::SystemLibrary,
                            address,
                        );
                    }
                }
                match reference.address {
                    Some(address) => {
                        bindings.insert(reference.name.clone(), address);
                    }
                    None => missing.push(reference.name.clone()),
                }
            }
        }
        linker.references.extend(references);
        if !missing.is_empty() {
            return Err(LinkError::UnresolvedSymbols {
                unit: format!("region '{region}'"),
                names: missing,
            });
        }
    }

    if !compile.is_empty() {
        log::debug!(
            "region '{region}': compiling {} functions on {} workers",
            compile.len(),
            engine.pool().worker_count()
        );
        let mut jobs = Vec::with_capacity(compile.len());
        let mut names = Vec::with_capacity(compile.len());
        for id in compile {
            let Some(pending) = linker.pending.remove(&id) else {
                continue;
            };
            names.push(pending.name.clone());
            let isa = Arc::clone(&linker.isa);
            jobs.push(move || compile_function(&*isa, id, pending));
        }
        let results = engine.pool().run_batch(jobs);
        for (name, result) in names.into_iter().zip(results) {
            let compiled = result.unwrap_or_else(|| {
                Err(LinkError::Codegen {
                    function: name,
                    message: "code generator panicked".into(),
                })
            })?;
            linker.module.define_function_bytes(
                compiled.id,
                &compiled.function,
                compiled.alignment,
                &compiled.bytes,
                &compiled.relocs,
            )?;
            linker.defined.insert(SymbolId::Func(compiled.id));
        }
    }

    linker.module.finalize_definitions()?;
    linker.unfinalized = false;
    linker.data_references.clear();
    let finalized = mem::take(&mut linker.new_tls_controls);
    linker.tls_controls.extend(finalized);
    Ok(linker.address(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineCreateInfo;
    use crate::image::{IMAGE_BASE_OFFSET, IMAGE_BASE_SYMBOL, ImageHeaderMode, PE_HEADER_SIZE};
    use crate::pool::PoolSettings;
    use frontend::{CollectingSink, CompileFrontend, FrontendCreateInfo};
    use std::cell::RefCell;

    fn engine_with(info: EngineCreateInfo) -> LinkEngine {
        LinkEngine::new(EngineCreateInfo {
            pool: PoolSettings {
                workers: 2,
                ..PoolSettings::default()
            },
            ..info
        })
        .unwrap()
    }

    fn isolated() -> LinkEngine {
        engine_with(EngineCreateInfo {
            search_process: false,
            ..EngineCreateInfo::default()
        })
    }

    fn compile(engine: &LinkEngine, source: &str, name: &str) -> IntermediateModule {
        let sink = Arc::new(CollectingSink::new());
        let mut frontend = CompileFrontend::new(
            FrontendCreateInfo {
                layout: engine.layout(),
                ..FrontendCreateInfo::default()
            },
            sink.clone(),
        )
        .unwrap();
        let module = frontend.compile(source, name);
        assert!(!module.is_empty(), "{:?}", sink.snapshot());
        module
    }

    fn unary(address: usize) -> extern "C" fn(i32) -> i32 {
        unsafe { mem::transmute(address) }
    }

    fn nullary(address: usize) -> extern "C" fn() -> i32 {
        unsafe { mem::transmute(address) }
    }

    #[test]
    fn functions_compile_on_first_lookup() {
        let engine = isolated();
        let mut region = engine.create_code_region("lazy").unwrap();
        assert_eq!(region.state(), RegionState::Created);
        region
            .add_module(compile(
                &engine,
                "extern \"C\" int add1(int x) { return x + 1; }\n\
                 extern \"C\" int unused() { return 0; }\n",
                "lazy",
            ))
            .unwrap();
        assert_eq!(region.state(), RegionState::ModulesAdded);
        let before = region.pending_functions();
        assert!(before >= 2);

        let add1 = region.lookup_address("add1").unwrap();
        assert_eq!(region.pending_functions(), before - 1);
        assert_eq!(unary(add1)(41), 42);
        assert_eq!(region.lookup_address("add1").unwrap(), add1);
        assert_eq!(region.module_names(), ["lazy"]);
    }

    #[test]
    fn callees_are_compiled_with_their_caller() {
        let engine = isolated();
        let mut region = engine.create_code_region("calls").unwrap();
        region
            .add_module(compile(
                &engine,
                "static int square(int x) { return x * x; }\n\
                 int twice(int x) { return x * 2; }\n\
                 extern \"C\" int compute(int x) { return square(x) + twice(x); }\n",
                "calls",
            ))
            .unwrap();
        let compute = region.lookup_address("compute").unwrap();
        assert_eq!(unary(compute)(5), 35);
        // mangled exports are visible too
        let twice = region.lookup_address("_Z5twicei").unwrap();
        assert_eq!(unary(twice)(21), 42);
    }

    #[test]
    fn exported_data_is_readable() {
        let engine = isolated();
        let mut region = engine.create_code_region("data").unwrap();
        region
            .add_module(compile(&engine, "int answer = 6 * 7;\n", "data"))
            .unwrap();
        let answer = region.lookup::<i32>("answer").unwrap();
        assert_eq!(unsafe { *answer }, 42);
    }

    #[test]
    fn lifecycle_is_enforced() {
        let engine = isolated();
        let mut region = engine.create_code_region("life").unwrap();
        assert!(matches!(
            region.initialize(),
            Err(LinkError::InvalidState {
                state: RegionState::Created,
                ..
            })
        ));
        assert!(matches!(
            region.deinitialize(),
            Err(LinkError::InvalidState { .. })
        ));
        region
            .add_module(compile(&engine, "extern \"C\" int one() { return 1; }\n", "life"))
            .unwrap();
        region.initialize().unwrap();
        assert_eq!(region.state(), RegionState::Initialized);
        assert!(matches!(
            region.add_module(compile(&engine, "int two() { return 2; }\n", "late")),
            Err(LinkError::InvalidState { .. })
        ));
        region.deinitialize().unwrap();
        assert_eq!(region.state(), RegionState::Deinitialized);
        region.initialize().unwrap();
        region.deinitialize().unwrap();

        engine.destroy_code_region(&mut region).unwrap();
        assert_eq!(region.state(), RegionState::Destroyed);
        assert!(matches!(
            region.lookup_address("one"),
            Err(LinkError::RegionDestroyed(name)) if name == "life"
        ));
        assert!(matches!(region.destroy(), Err(LinkError::RegionDestroyed(_))));
        assert!(region.module_names().is_empty());
    }

    #[test]
    fn empty_modules_are_rejected_without_failing_the_region() {
        let engine = isolated();
        let mut region = engine.create_code_region("empty").unwrap();
        let err = region
            .add_module(IntermediateModule::empty("broken"))
            .unwrap_err();
        assert!(matches!(err, LinkError::EmptyModule(name) if name == "broken"));
        assert_eq!(region.state(), RegionState::Created);
    }

    #[test]
    fn undefined_lookup_keeps_the_region_usable() {
        let engine = isolated();
        let mut region = engine.create_code_region("undef").unwrap();
        region
            .add_module(compile(&engine, "extern \"C\" int one() { return 1; }\n", "undef"))
            .unwrap();
        assert!(matches!(
            region.lookup_address("two"),
            Err(LinkError::UndefinedSymbol { name, .. }) if name == "two"
        ));
        assert_eq!(region.state(), RegionState::ModulesAdded);
        assert_eq!(nullary(region.lookup_address("one").unwrap())(), 1);
    }

    #[test]
    fn duplicate_exports_fail_the_region() {
        let engine = isolated();
        let mut region = engine.create_code_region("dup").unwrap();
        region
            .add_module(compile(&engine, "extern \"C\" int f() { return 1; }\n", "a"))
            .unwrap();
        let err = region
            .add_module(compile(&engine, "extern \"C\" int f() { return 2; }\n", "b"))
            .unwrap_err();
        assert!(matches!(err, LinkError::DuplicateSymbol { name, .. } if name == "f"));
        assert_eq!(region.state(), RegionState::Failed);
        assert!(matches!(
            region.lookup_address("f"),
            Err(LinkError::RegionFailed(_))
        ));
        region.destroy().unwrap();
    }

    #[test]
    fn module_locals_do_not_collide() {
        let engine = isolated();
        let mut region = engine.create_code_region("locals").unwrap();
        region
            .add_module(compile(
                &engine,
                "static int value() { return 1; }\nextern \"C\" int first() { return value(); }\n",
                "a",
            ))
            .unwrap();
        region
            .add_module(compile(
                &engine,
                "static int value() { return 2; }\nextern \"C\" int second() { return value(); }\n",
                "b",
            ))
            .unwrap();
        assert_eq!(nullary(region.lookup_address("first").unwrap())(), 1);
        assert_eq!(nullary(region.lookup_address("second").unwrap())(), 2);
    }

    extern "C" fn host_triple(x: i32) -> i32 {
        x * 3
    }

    #[test]
    fn absolute_symbols_bind_before_the_chain() {
        let engine = isolated();
        let mut region = engine.create_code_region("abs").unwrap();
        region
            .define_absolute_symbols([("host_triple", host_triple as usize)])
            .unwrap();
        region
            .add_module(compile(
                &engine,
                "extern \"C\" int host_triple(int x);\n\
                 extern \"C\" int call(int x) { return host_triple(x) + 1; }\n",
                "abs",
            ))
            .unwrap();
        assert_eq!(unary(region.lookup_address("call").unwrap())(4), 13);
        let reference = region
            .symbol_references()
            .iter()
            .find(|r| r.name == "host_triple")
            .unwrap();
        assert_eq!(reference.stage, Some(ResolverStage::Absolute));

        let mut other = engine.create_code_region("abs-dup").unwrap();
        other.define_absolute_symbols([("twice", 1usize)]).unwrap();
        let err = other
            .add_module(compile(&engine, "extern \"C\" int twice() { return 2; }\n", "t"))
            .unwrap_err();
        assert!(matches!(err, LinkError::DuplicateSymbol { .. }));
    }

    #[test]
    fn unresolved_imports_are_reported_together() {
        let engine = isolated();
        let mut region = engine.create_code_region("missing").unwrap();
        region
            .add_module(compile(
                &engine,
                "extern \"C\" int nowhere_a();\n\
                 extern \"C\" int nowhere_b();\n\
                 extern \"C\" int call() { return nowhere_a() + nowhere_b(); }\n",
                "missing",
            ))
            .unwrap();
        let err = region.lookup_address("call").unwrap_err();
        let mut names = match err {
            LinkError::UnresolvedSymbols { names, .. } => names,
            other => panic!("unexpected error {other}"),
        };
        names.sort();
        assert_eq!(names, ["nowhere_a", "nowhere_b"]);
        assert_eq!(region.state(), RegionState::Failed);
    }

    #[cfg(unix)]
    #[test]
    fn process_symbols_resolve_libc() {
        let engine = engine_with(EngineCreateInfo::default());
        let mut region = engine.create_code_region("libc").unwrap();
        region
            .add_module(compile(
                &engine,
                "extern \"C\" int abs(int x);\n\
                 extern \"C\" int magnitude(int x) { return abs(x); }\n",
                "libc",
            ))
            .unwrap();
        assert_eq!(unary(region.lookup_address("magnitude").unwrap())(-7), 7);
        let reference = region
            .symbol_references()
            .iter()
            .find(|r| r.name == "abs")
            .unwrap();
        assert_eq!(reference.stage, Some(ResolverStage::Host));
    }

    thread_local! {
        static EVENTS: RefCell<Vec<i32>> = const { RefCell::new(Vec::new()) };
    }

    extern "C" fn record(event: i32) {
        EVENTS.with(|events| events.borrow_mut().push(event));
    }

    fn take_events() -> Vec<i32> {
        EVENTS.with(|events| mem::take(&mut *events.borrow_mut()))
    }

    #[test]
    fn static_initialization_order() {
        let engine = isolated();
        let mut region = engine.create_code_region("init").unwrap();
        region
            .define_absolute_symbols([("record", record as usize)])
            .unwrap();
        region
            .add_module(compile(
                &engine,
                "extern \"C\" void record(int event);\n\
                 int seed() { record(1); return 3; }\n\
                 int value = seed();\n\
                 __attribute__((constructor)) void start_a() { record(2); }\n\
                 __attribute__((destructor)) void stop_a() { record(3); }\n",
                "a",
            ))
            .unwrap();
        region
            .add_module(compile(
                &engine,
                "extern \"C\" void record(int event);\n\
                 __attribute__((constructor)) void start_b() { record(10); }\n\
                 __attribute__((destructor)) void stop_b() { record(30); }\n",
                "b",
            ))
            .unwrap();
        take_events();

        region.initialize().unwrap();
        assert_eq!(take_events(), [1, 2, 10]);
        let value = region.lookup::<i32>("value").unwrap();
        assert_eq!(unsafe { *value }, 3);

        region.deinitialize().unwrap();
        assert_eq!(take_events(), [30, 3]);
    }

    #[test]
    fn thread_locals_are_per_thread() {
        let engine = isolated();
        let mut region = engine.create_code_region("tls").unwrap();
        region
            .add_module(compile(
                &engine,
                "thread_local int counter = 5;\n\
                 extern \"C\" int bump() { counter += 1; return counter; }\n",
                "tls",
            ))
            .unwrap();
        region.initialize().unwrap();
        let bump = region.lookup_address("bump").unwrap();
        assert_eq!(nullary(bump)(), 6);
        assert_eq!(nullary(bump)(), 7);
        let other = std::thread::spawn(move || (nullary(bump)(), nullary(bump)()))
            .join()
            .unwrap();
        assert_eq!(other, (6, 7));
        assert_eq!(nullary(bump)(), 8);
        region.deinitialize().unwrap();
    }

    #[test]
    fn destroyed_regions_return_thread_local_slots() {
        let engine = isolated();
        let baseline = runtime::thread_instances();
        for round in 0..4 {
            let mut region = engine.create_code_region("tls-cycle").unwrap();
            region
                .add_module(compile(
                    &engine,
                    "thread_local int hits = 10;
                     thread_local int misses;
                     extern \"C\" int hit() { misses += 0; hits += 1; return hits; }
",
                    "cycle",
                ))
                .unwrap();
            let hit = region.lookup_address("hit").unwrap();
            assert_eq!(nullary(hit)(), 11, "round {round}");
            assert_eq!(runtime::thread_instances(), baseline + 2);

            region.destroy().unwrap();
            assert_eq!(runtime::thread_instances(), baseline);
        }
    }

    #[test]
    fn image_header_points_at_itself() {
        let engine = engine_with(EngineCreateInfo {
            search_process: false,
            image_header: ImageHeaderMode::Always,
            ..EngineCreateInfo::default()
        });
        if !matches!(engine.isa().name(), "x64" | "aarch64") {
            return;
        }
        let mut region = engine.create_code_region("pe").unwrap();
        let base = region.lookup_address(IMAGE_BASE_SYMBOL).unwrap();
        let header = unsafe { std::slice::from_raw_parts(base as *const u8, PE_HEADER_SIZE) };
        assert_eq!(&header[..2], b"MZ");
        let image_base = u64::from_le_bytes(
            header[IMAGE_BASE_OFFSET..IMAGE_BASE_OFFSET + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(image_base as usize, base);

        let err = region
            .add_module(compile(&engine, "int __ImageBase = 1;\n", "clash"))
            .unwrap_err();
        assert!(matches!(err, LinkError::DuplicateSymbol { .. }));
    }

    #[test]
    fn pragma_libraries_are_recorded() {
        let engine = isolated();
        let mut region = engine.create_code_region("libs").unwrap();
        region
            .add_module(compile(
                &engine,
                "#pragma comment(lib, \"hostjit-no-such-library\")\nint x = 1;\n",
                "libs",
            ))
            .unwrap();
        assert_eq!(region.dependent_libraries(), ["hostjit-no-such-library"]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn pragma_libraries_bind_only_their_region() {
        if !LibraryResolver::new().add("libc.so.6") {
            return;
        }
        let engine = isolated();
        let source = "extern \"C\" int abs(int x);\n\
                      extern \"C\" int magnitude(int x) { return abs(x); }\n";

        let mut with = engine.create_code_region("with-libc").unwrap();
        with.add_module(compile(
            &engine,
            &format!("#pragma comment(lib, \"libc.so.6\")\n{source}"),
            "with",
        ))
        .unwrap();
        let magnitude = with.lookup_address("magnitude").unwrap();
        assert_eq!(unary(magnitude)(-5), 5);
        let stage = with
            .symbol_references()
            .iter()
            .find(|r| r.name == "abs")
            .and_then(|r| r.stage);
        assert_eq!(stage, Some(ResolverStage::SystemLibrary));
        assert_eq!(engine.resolvers().cached("abs"), None);

        let mut without = engine.create_code_region("without-libc").unwrap();
        without.add_module(compile(&engine, source, "without")).unwrap();
        assert!(matches!(
            without.lookup_address("magnitude"),
            Err(LinkError::UnresolvedSymbols { names, .. }) if names == ["abs"]
        ));
    }
}
