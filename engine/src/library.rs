//! Last resolver stage: shared libraries named by import archives and by
//! `#pragma comment(lib, ...)`.

use std::ffi::{OsString, c_void};

use libloading::Library;
use parking_lot::RwLock;

use crate::error::LinkError;
use crate::resolver::{ResolverChain, ResolverStage, SymbolResolver};

struct OpenLibrary {
    name: String,
    library: Library,
}

#[derive(Default)]
pub struct LibraryResolver {
    libraries: RwLock<Vec<OpenLibrary>>,
    failed: RwLock<Vec<String>>,
}

impl LibraryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `name` unless it is already open. Tries the name as given,
    /// then the platform file name (`libm.so`, `m.dll`, ...). A library
    /// that cannot be opened is reported once and skipped.
    pub fn add(&self, name: &str) -> bool {
        if self.libraries.read().iter().any(|l| l.name == name) {
            return true;
        }
        if self.failed.read().iter().any(|l| l == name) {
            return false;
        }

        let candidates: [OsString; 2] = [name.into(), libloading::library_filename(name)];
        let mut last_error = None;
        for candidate in &candidates {
            // SAFETY: running a library's initializers is the point of
            // linking against it
            match unsafe { Library::new(candidate) } {
                Ok(library) => {
                    log::debug!("opened library '{name}' as {}", candidate.to_string_lossy());
                    self.libraries.write().push(OpenLibrary {
                        name: name.to_string(),
                        library,
                    });
                    return true;
                }
                Err(err) => last_error = Some(err),
            }
        }
        if let Some(err) = last_error {
            log::warn!("cannot open library '{name}': {err}");
        }
        self.failed.write().push(name.to_string());
        false
    }

    pub fn names(&self) -> Vec<String> {
        self.libraries.read().iter().map(|l| l.name.clone()).collect()
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.libraries.read().iter().find_map(|l| {
            // SAFETY: the address is only handed out
            let symbol = unsafe { l.library.get::<*mut c_void>(name.as_bytes()) }.ok()?;
            let address = *symbol as usize;
            (address != 0).then_some(address)
        })
    }
}

impl SymbolResolver for LibraryResolver {
    fn stage(&self) -> ResolverStage {
        ResolverStage::SystemLibrary
    }

    fn resolve(
        &self,
        names: &[String],
        _chain: &ResolverChain,
    ) -> Result<Vec<(String, usize)>, LinkError> {
        Ok(names
            .iter()
            .filter_map(|name| self.lookup(name).map(|address| (name.clone(), address)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_libraries_are_skipped() {
        let libraries = LibraryResolver::new();
        assert!(!libraries.add("hostjit-no-such-library"));
        assert!(!libraries.add("hostjit-no-such-library"));
        assert!(libraries.names().is_empty());
        assert_eq!(libraries.lookup("cos"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn opens_libm_by_file_name() {
        let libraries = LibraryResolver::new();
        if libraries.add("libm.so.6") {
            assert!(libraries.lookup("cos").is_some());
            assert_eq!(libraries.names(), ["libm.so.6"]);
        }
    }
}
