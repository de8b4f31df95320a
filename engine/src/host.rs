//! Symbols already present in the running process.

use std::collections::HashMap;
use std::ffi::c_void;

use crate::error::LinkError;
use crate::resolver::{ResolverChain, ResolverStage, SymbolResolver};

/// Marker the Windows toolchain puts in front of imported data and
/// function pointers.
const IMPORT_PREFIX: &str = "__imp_";

/// Name-to-address view of the host.
pub trait HostSymbolDirectory: Send + Sync {
    fn lookup(&self, name: &str) -> Option<usize>;
}

impl<F> HostSymbolDirectory for F
where
    F: Fn(&str) -> Option<usize> + Send + Sync,
{
    fn lookup(&self, name: &str) -> Option<usize> {
        self(name)
    }
}

/// A fixed table of symbols, e.g. functions the host exports to scripts.
#[derive(Debug, Clone, Default)]
pub struct StaticSymbols {
    map: HashMap<String, usize>,
}

impl StaticSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, address: usize) -> Option<usize> {
        self.map.insert(name.into(), address)
    }

    pub fn with(mut self, name: impl Into<String>, address: usize) -> Self {
        self.insert(name, address);
        self
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, usize)> for StaticSymbols {
    fn from_iter<I: IntoIterator<Item = (S, usize)>>(iter: I) -> Self {
        Self {
            map: iter.into_iter().map(|(n, a)| (n.into(), a)).collect(),
        }
    }
}

impl HostSymbolDirectory for StaticSymbols {
    fn lookup(&self, name: &str) -> Option<usize> {
        self.map.get(name).copied()
    }
}

/// Everything the dynamic loader can see from the main program.
pub struct ProcessSymbols {
    #[cfg(unix)]
    library: libloading::os::unix::Library,
    #[cfg(windows)]
    library: libloading::os::windows::Library,
}

impl ProcessSymbols {
    #[cfg(unix)]
    pub fn new() -> Result<Self, libloading::Error> {
        Ok(Self {
            library: libloading::os::unix::Library::this(),
        })
    }

    #[cfg(windows)]
    pub fn new() -> Result<Self, libloading::Error> {
        Ok(Self {
            library: libloading::os::windows::Library::this()?,
        })
    }
}

impl HostSymbolDirectory for ProcessSymbols {
    fn lookup(&self, name: &str) -> Option<usize> {
        // SAFETY: the address is only handed out, never called through
        // this typed view
        let symbol = unsafe { self.library.get::<*mut c_void>(name.as_bytes()) }.ok()?;
        let address = *symbol as usize;
        (address != 0).then_some(address)
    }
}

/// First resolver stage: the host's own address space.
pub struct HostResolver {
    directories: Vec<Box<dyn HostSymbolDirectory>>,
    global_prefix: String,
}

impl HostResolver {
    pub fn new(directories: Vec<Box<dyn HostSymbolDirectory>>) -> Self {
        Self {
            directories,
            global_prefix: String::new(),
        }
    }

    /// Prefix the object format adds to every global, stripped before
    /// asking the directories.
    pub fn with_global_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.global_prefix = prefix.into();
        self
    }

    pub fn host_name<'n>(&self, name: &'n str) -> &'n str {
        let name = name.strip_prefix(IMPORT_PREFIX).unwrap_or(name);
        if self.global_prefix.is_empty() {
            return name;
        }
        name.strip_prefix(self.global_prefix.as_str()).unwrap_or(name)
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        let host_name = self.host_name(name);
        self.directories.iter().find_map(|d| d.lookup(host_name))
    }
}

impl SymbolResolver for HostResolver {
    fn stage(&self) -> ResolverStage {
        ResolverStage::Host
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

    extern "C" fn host_answer() -> i32 {
        42
    }

    #[test]
    fn directories_are_searched_in_order() {
        let first = StaticSymbols::new().with("answer", host_answer as usize);
        let second = |name: &str| (name == "answer" || name == "other").then_some(1usize);
        let host = HostResolver::new(vec![Box::new(first), Box::new(second)]);
        assert_eq!(host.lookup("answer"), Some(host_answer as usize));
        assert_eq!(host.lookup("other"), Some(1));
        assert_eq!(host.lookup("missing"), None);
    }

    #[test]
    fn import_marker_and_global_prefix_are_stripped() {
        let table: StaticSymbols = [("answer", 7usize)].into_iter().collect();
        let host = HostResolver::new(vec![Box::new(table)]).with_global_prefix("_");
        assert_eq!(host.host_name("__imp__answer"), "answer");
        assert_eq!(host.lookup("__imp__answer"), Some(7));
        assert_eq!(host.lookup("_answer"), Some(7));
        assert_eq!(host.lookup("answer"), Some(7));
    }

    #[cfg(unix)]
    #[test]
    fn process_symbols_find_libc() {
        let process = ProcessSymbols::new().unwrap();
        assert!(process.lookup("malloc").is_some());
        assert!(process.lookup("hostjit_no_such_symbol").is_none());
    }
}
