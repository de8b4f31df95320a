//! Second resolver stage: precompiled `ar` archives.
//!
//! Opening an archive only indexes it. A member is loaded the first time
//! one of its global symbols is requested; its own undefined references
//! are resolved through the whole chain, which may load further members.
//! Import members (short COFF import descriptions) contribute the names of
//! the shared libraries the archive depends on.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};

use object::read::archive::ArchiveFile;
use object::read::coff::ImportFile;
use object::{Object, ObjectSymbol};
use parking_lot::{Mutex, ReentrantMutex};

use crate::error::LinkError;
use crate::loader::{LoadedObject, ObjectImage};
use crate::resolver::{ResolverChain, ResolverStage, SymbolResolver};

/// An archive and the libraries its import members name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportArchiveDescriptor {
    pub path: PathBuf,
    pub libraries: Vec<String>,
}

struct Member {
    name: String,
    offset: usize,
    size: usize,
}

struct Archive {
    descriptor: ImportArchiveDescriptor,
    bytes: Vec<u8>,
    members: Vec<Member>,
}

impl Archive {
    fn member_bytes(&self, member: &Member) -> &[u8] {
        &self.bytes[member.offset..member.offset + member.size]
    }

    fn member_label(&self, member: &Member) -> String {
        format!("{}({})", self.descriptor.path.display(), member.name)
    }
}

#[derive(Default)]
struct ArchiveState {
    loaded: HashSet<(usize, usize)>,
    symbols: HashMap<String, usize>,
    objects: Vec<LoadedObject>,
}

/// Members taken up by the resolution currently running on the loading
/// thread. Nothing here is visible to other threads until the outermost
/// load succeeds and commits it.
#[derive(Default)]
struct LoadTransaction {
    depth: usize,
    members: HashSet<(usize, usize)>,
    symbols: HashMap<String, usize>,
    objects: Vec<LoadedObject>,
}

#[derive(Default)]
pub struct ArchiveResolver {
    archives: Vec<Archive>,
    /// Global symbol to (archive, member). The first definition wins.
    index: HashMap<String, (usize, usize)>,
    state: Mutex<ArchiveState>,
    loading: ReentrantMutex<RefCell<LoadTransaction>>,
}

impl ArchiveResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(paths: &[PathBuf]) -> Result<Self, LinkError> {
        let mut resolver = Self::new();
        for path in paths {
            resolver.add_archive(path)?;
        }
        Ok(resolver)
    }

    pub fn add_archive(&mut self, path: &Path) -> Result<&ImportArchiveDescriptor, LinkError> {
        let bytes = fs::read(path).map_err(|err| LinkError::archive(path, err.to_string()))?;
        self.add_archive_bytes(path, bytes)
    }

    pub fn add_archive_bytes(
        &mut self,
        path: &Path,
        bytes: Vec<u8>,
    ) -> Result<&ImportArchiveDescriptor, LinkError> {
        let archive_index = self.archives.len();
        let mut members = Vec::new();
        let mut libraries: Vec<String> = Vec::new();
        {
            let file = ArchiveFile::parse(bytes.as_slice())
                .map_err(|err| LinkError::archive(path, err.to_string()))?;
            for member in file.members() {
                let member = member.map_err(|err| LinkError::archive(path, err.to_string()))?;
                let name = String::from_utf8_lossy(member.name()).into_owned();
                let (offset, size) = member.file_range();
                let data = member
                    .data(bytes.as_slice())
                    .map_err(|err| LinkError::archive(path, err.to_string()))?;

                if let Ok(import) = ImportFile::parse(data) {
                    let dll = String::from_utf8_lossy(import.dll()).into_owned();
                    if !libraries.contains(&dll) {
                        libraries.push(dll);
                    }
                    continue;
                }
                let Ok(object) = object::File::parse(data) else {
                    log::debug!("{}: skipping member '{name}'", path.display());
                    continue;
                };
                let member_index = members.len();
                for symbol in object.symbols() {
                    if symbol.is_undefined() || !symbol.is_global() {
                        continue;
                    }
                    if let Ok(symbol_name) = symbol.name() {
                        if !symbol_name.is_empty() {
                            self.index
                                .entry(symbol_name.to_string())
                                .or_insert((archive_index, member_index));
                        }
                    }
                }
                members.push(Member {
                    name,
                    offset: offset as usize,
                    size: size as usize,
                });
            }
        }
        log::info!(
            "indexed import archive {} ({} objects, {} libraries)",
            path.display(),
            members.len(),
            libraries.len()
        );
        self.archives.push(Archive {
            descriptor: ImportArchiveDescriptor {
                path: path.to_path_buf(),
                libraries,
            },
            bytes,
            members,
        });
        Ok(&self.archives[archive_index].descriptor)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ImportArchiveDescriptor> {
        self.archives.iter().map(|a| &a.descriptor)
    }

    pub fn defines(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn loaded_members(&self) -> Vec<String> {
        self.state.lock().objects.iter().map(|o| o.name.clone()).collect()
    }

    fn load_member(
        &self,
        transaction: &RefCell<LoadTransaction>,
        archive_index: usize,
        member_index: usize,
        chain: &ResolverChain,
    ) -> Result<(), LinkError> {
        let key = (archive_index, member_index);
        if self.state.lock().loaded.contains(&key)
            || !transaction.borrow_mut().members.insert(key)
        {
            return Ok(());
        }
        let archive = &self.archives[archive_index];
        let member = &archive.members[member_index];
        let label = archive.member_label(member);
        let image = ObjectImage::layout(&label, archive.member_bytes(member))?;

        // members that refer back to this one bind to these addresses while
        // it is still being linked
        {
            let mut transaction = transaction.borrow_mut();
            for (name, address) in image.definitions() {
                transaction.symbols.entry(name.clone()).or_insert(*address);
            }
        }

        let references = chain.resolve(image.undefined())?;
        let mut imports = HashMap::new();
        let mut missing = Vec::new();
        for reference in references {
            match reference.address {
                Some(address) => {
                    imports.insert(reference.name, address);
                }
                None if image.is_weak(&reference.name) => {}
                None => missing.push(reference.name),
            }
        }
        if !missing.is_empty() {
            log::error!("{label}: unresolved symbols {}", missing.join(", "));
            return Err(LinkError::UnresolvedSymbols {
                unit: label,
                names: missing,
            });
        }

        let object = image.link(&imports)?;
        log::debug!("linked archive member {label}");
        transaction.borrow_mut().objects.push(object);
        Ok(())
    }

    fn lookup(&self, transaction: &RefCell<LoadTransaction>, name: &str) -> Option<usize> {
        if let Some(address) = self.state.lock().symbols.get(name) {
            return Some(*address);
        }
        transaction.borrow().symbols.get(name).copied()
    }

    /// Publishes everything the finished transaction linked.
    fn commit(&self, transaction: LoadTransaction) {
        let mut state = self.state.lock();
        for object in &transaction.objects {
            log::info!("loaded archive member {}", object.name);
            for (name, address) in &object.definitions {
                state.symbols.entry(name.clone()).or_insert(*address);
            }
        }
        state.loaded.extend(transaction.members);
        state.objects.extend(transaction.objects);
    }

    /// Unmaps everything the failed transaction linked and forgets the
    /// bindings nested resolutions made to it.
    fn roll_back(&self, transaction: LoadTransaction, chain: &ResolverChain) {
        chain.forget(
            transaction
                .symbols
                .iter()
                .map(|(name, address)| (name.as_str(), *address)),
        );
        log::debug!(
            "rolled back {} archive members",
            transaction.members.len()
        );
    }
}

impl SymbolResolver for ArchiveResolver {
    fn stage(&self) -> ResolverStage {
        ResolverStage::ImportArchive
    }

    fn resolve(
        &self,
        names: &[String],
        chain: &ResolverChain,
    ) -> Result<Vec<(String, usize)>, LinkError> {
        let guard = self.loading.lock();
        let transaction: &RefCell<LoadTransaction> = &guard;
        transaction.borrow_mut().depth += 1;

        let mut result = Ok(Vec::new());
        for name in names {
            let Some(&(archive, member)) = self.index.get(name) else {
                continue;
            };
            if let Err(err) = self.load_member(transaction, archive, member, chain) {
                result = Err(err);
                break;
            }
            if let (Some(address), Ok(found)) = (self.lookup(transaction, name), &mut result) {
                found.push((name.clone(), address));
            }
        }

        let outermost = {
            let mut current = transaction.borrow_mut();
            current.depth -= 1;
            current.depth == 0
        };
        if outermost {
            let finished = mem::take(&mut *transaction.borrow_mut());
            match &result {
                Ok(_) => self.commit(finished),
                Err(_) => self.roll_back(finished, chain),
            }
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal System V `ar` writer for test fixtures.
    pub(crate) fn write_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = b"!<arch>\n".to_vec();
        for (name, data) in members {
            let header = format!(
                "{:<16}{:<12}{:<6}{:<6}{:<8}{:<10}`\n",
                format!("{name}/"),
                0,
                0,
                0,
                644,
                data.len()
            );
            assert_eq!(header.len(), 60);
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(data);
            if data.len() % 2 == 1 {
                out.push(b'\n');
            }
        }
        out
    }

    #[test]
    fn rejects_non_archives() {
        let mut resolver = ArchiveResolver::new();
        let err = resolver
            .add_archive_bytes(Path::new("bogus.a"), b"not an archive".to_vec())
            .err()
            .unwrap();
        assert!(matches!(err, LinkError::Archive { .. }));
        assert!(
            ArchiveResolver::open(&[PathBuf::from("/nonexistent/hostjit.a")]).is_err()
        );
    }

    #[test]
    fn foreign_members_are_skipped() {
        let bytes = write_archive(&[("readme.txt", b"hello")]);
        let mut resolver = ArchiveResolver::new();
        let descriptor = resolver
            .add_archive_bytes(Path::new("docs.a"), bytes)
            .unwrap()
            .clone();
        assert!(descriptor.libraries.is_empty());
        let chain = ResolverChain::new();
        assert!(resolver.resolve(&["hello".to_string()], &chain).unwrap().is_empty());
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    mod linking {
        use super::*;
        use crate::host::{HostResolver, StaticSymbols};
        use crate::loader::tests::{ElfBuilder, TAIL_CALL, return_constant};
        use object::elf;
        use std::sync::Arc;

        extern "C" fn host_increment(x: i32) -> i32 {
            x + 1
        }

        /// `first` tail-calls `second`, which lives in another member and
        /// tail-calls the host.
        fn fixture() -> Vec<u8> {
            let mut first = ElfBuilder::new();
            let (text, offset) = first.function("first", &TAIL_CALL);
            let second_ref = first.import("second");
            first.relocate(text, offset + 1, second_ref, elf::R_X86_64_PLT32);
            first.function("unused", &return_constant(0));

            let mut second = ElfBuilder::new();
            let (text, offset) = second.function("second", &TAIL_CALL);
            let host = second.import("host_increment");
            second.relocate(text, offset + 1, host, elf::R_X86_64_PLT32);

            let first = first.finish();
            let second = second.finish();
            write_archive(&[("first.o", &first), ("second.o", &second)])
        }

        #[test]
        fn members_load_on_demand_and_resolve_through_the_chain() {
            let mut archives = ArchiveResolver::new();
            archives
                .add_archive_bytes(Path::new("libfixture.a"), fixture())
                .unwrap();
            assert!(archives.defines("first"));
            assert!(archives.defines("second"));
            let archives = Arc::new(archives);

            let host = StaticSymbols::new().with("host_increment", host_increment as usize);
            let chain = ResolverChain::new()
                .with(Box::new(HostResolver::new(vec![Box::new(host)])))
                .with(Box::new(Arc::clone(&archives)));

            let refs = chain.resolve(&["first".to_string()]).unwrap();
            assert_eq!(refs[0].stage, Some(ResolverStage::ImportArchive));
            let loaded = archives.loaded_members();
            assert_eq!(loaded.len(), 2);
            assert!(loaded[0].starts_with("libfixture.a(second"), "{loaded:?}");
            assert!(loaded[1].starts_with("libfixture.a(first"), "{loaded:?}");

            // SAFETY: `first` ends up in `int host_increment(int)`
            let first: extern "C" fn(i32) -> i32 =
                unsafe { std::mem::transmute(refs[0].address.unwrap()) };
            assert_eq!(first(41), 42);
        }

        #[test]
        fn host_symbols_shadow_archive_members() {
            let mut archives = ArchiveResolver::new();
            archives
                .add_archive_bytes(Path::new("libfixture.a"), fixture())
                .unwrap();
            let archives = Arc::new(archives);

            // the host's `second` wins, so only the first member is linked
            let host = StaticSymbols::new().with("second", host_increment as usize);
            let chain = ResolverChain::new()
                .with(Box::new(Arc::clone(&archives)))
                .with(Box::new(HostResolver::new(vec![Box::new(host)])));

            let refs = chain.resolve(&["first".to_string()]).unwrap();
            assert_eq!(archives.loaded_members().len(), 1);
            assert_eq!(
                chain.cached("second"),
                Some((ResolverStage::Host, host_increment as usize))
            );
            // SAFETY: `first` tail-calls `host_increment`
            let first: extern "C" fn(i32) -> i32 =
                unsafe { std::mem::transmute(refs[0].address.unwrap()) };
            assert_eq!(first(1), 2);
        }

        #[test]
        fn unresolvable_member_fails() {
            let mut archives = ArchiveResolver::new();
            archives
                .add_archive_bytes(Path::new("libfixture.a"), fixture())
                .unwrap();
            let archives = Arc::new(archives);
            let chain = ResolverChain::new().with(Box::new(Arc::clone(&archives)));
            let err = chain.resolve(&["second".to_string()]).err().unwrap();
            assert!(
                matches!(err, LinkError::UnresolvedSymbols { names, .. } if names == ["host_increment"])
            );
        }

        #[test]
        fn failed_loads_leave_nothing_behind() {
            let mut archives = ArchiveResolver::new();
            archives
                .add_archive_bytes(Path::new("libfixture.a"), fixture())
                .unwrap();
            let archives = Arc::new(archives);

            // `first` links against `second`, which cannot be linked
            let chain = ResolverChain::new().with(Box::new(Arc::clone(&archives)));
            for name in ["first", "second", "first", "second"] {
                let err = chain.resolve(&[name.to_string()]).err().unwrap();
                assert!(matches!(err, LinkError::UnresolvedSymbols { .. }));
                assert!(archives.loaded_members().is_empty());
                assert_eq!(chain.cached("first"), None);
                assert_eq!(chain.cached("second"), None);
            }
        }

        #[test]
        fn failed_members_load_once_their_imports_exist() {
            let mut archives = ArchiveResolver::new();
            archives
                .add_archive_bytes(Path::new("libfixture.a"), fixture())
                .unwrap();
            let archives = Arc::new(archives);

            let bare = ResolverChain::new().with(Box::new(Arc::clone(&archives)));
            assert!(bare.resolve(&["first".to_string()]).is_err());

            let host = StaticSymbols::new().with("host_increment", host_increment as usize);
            let chain = ResolverChain::new()
                .with(Box::new(HostResolver::new(vec![Box::new(host)])))
                .with(Box::new(Arc::clone(&archives)));
            let refs = chain.resolve(&["first".to_string()]).unwrap();
            assert_eq!(refs[0].stage, Some(ResolverStage::ImportArchive));
            assert_eq!(archives.loaded_members().len(), 2);

            // SAFETY: `first` ends up in `int host_increment(int)`
            let first: extern "C" fn(i32) -> i32 =
                unsafe { std::mem::transmute(refs[0].address.unwrap()) };
            assert_eq!(first(9), 10);
        }

        #[test]
        fn concurrent_loads_wait_for_the_member() {
            let mut archives = ArchiveResolver::new();
            archives
                .add_archive_bytes(Path::new("libfixture.a"), fixture())
                .unwrap();
            let archives = Arc::new(archives);
            let host = StaticSymbols::new().with("host_increment", host_increment as usize);
            let chain = ResolverChain::new()
                .with(Box::new(HostResolver::new(vec![Box::new(host)])))
                .with(Box::new(Arc::clone(&archives)));

            let addresses: Vec<Option<usize>> = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..4)
                    .map(|_| scope.spawn(|| chain.resolve(&["first".to_string()]).unwrap()[0].address))
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            assert!(addresses.iter().all(|a| a.is_some() && *a == addresses[0]));
            assert_eq!(archives.loaded_members().len(), 2);
        }
    }
}
