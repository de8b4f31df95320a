//! Ordered chain of symbol resolution stages.
//!
//! Names a region (or a loaded archive member) needs are offered to each
//! stage in priority order. The first stage that binds a name wins and the
//! name is never shown to a later stage. Bindings are cached for the
//! lifetime of the chain.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::LinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResolverStage {
    /// Pre-bound for one region with `define_absolute_symbols`.
    Absolute,
    Host,
    ImportArchive,
    SystemLibrary,
}

impl fmt::Display for ResolverStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResolverStage::Absolute => "absolute",
            ResolverStage::Host => "host",
            ResolverStage::ImportArchive => "import archive",
            ResolverStage::SystemLibrary => "system library",
        })
    }
}

/// A name requested while linking and how it was bound, if at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolReference {
    pub name: String,
    pub stage: Option<ResolverStage>,
    pub address: Option<usize>,
}

impl SymbolReference {
    pub fn bound(name: impl Into<String>, stage: ResolverStage, address: usize) -> Self {
        Self {
            name: name.into(),
            stage: Some(stage),
            address: Some(address),
        }
    }

    pub fn unbound(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stage: None,
            address: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.address.is_some()
    }
}

pub trait SymbolResolver: Send + Sync {
    fn stage(&self) -> ResolverStage;

    /// Binds whichever of `names` this stage knows. Names it does not know
    /// are simply left out. `chain` resolves whatever the stage itself
    /// needs in order to produce a binding.
    fn resolve(
        &self,
        names: &[String],
        chain: &ResolverChain,
    ) -> Result<Vec<(String, usize)>, LinkError>;
}

impl<T: SymbolResolver + ?Sized> SymbolResolver for Arc<T> {
    fn stage(&self) -> ResolverStage {
        (**self).stage()
    }

    fn resolve(
        &self,
        names: &[String],
        chain: &ResolverChain,
    ) -> Result<Vec<(String, usize)>, LinkError> {
        (**self).resolve(names, chain)
    }
}

#[derive(Default)]
pub struct ResolverChain {
    stages: Vec<Box<dyn SymbolResolver>>,
    bound: RwLock<HashMap<String, (ResolverStage, usize)>>,
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages are kept sorted by priority; stages of equal priority keep
    /// their insertion order.
    pub fn push(&mut self, resolver: Box<dyn SymbolResolver>) {
        let stage = resolver.stage();
        let at = self
            .stages
            .iter()
            .position(|s| s.stage() > stage)
            .unwrap_or(self.stages.len());
        self.stages.insert(at, resolver);
    }

    pub fn with(mut self, resolver: Box<dyn SymbolResolver>) -> Self {
        self.push(resolver);
        self
    }

    pub fn stages(&self) -> Vec<ResolverStage> {
        self.stages.iter().map(|s| s.stage()).collect()
    }

    pub fn cached(&self, name: &str) -> Option<(ResolverStage, usize)> {
        self.bound.read().get(name).copied()
    }

    /// Drops cached bindings that still point at the given addresses, after
    /// the code behind them was unmapped.
    pub(crate) fn forget<'a>(&self, bindings: impl IntoIterator<Item = (&'a str, usize)>) {
        let mut bound = self.bound.write();
        for (name, address) in bindings {
            if bound.get(name).is_some_and(|(_, cached)| *cached == address) {
                log::debug!("forgetting '{name}' at {address:#x}");
                bound.remove(name);
            }
        }
    }

    /// One reference per distinct requested name, in request order.
    /// Unknown names come back unbound; that is not an error here.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<SymbolReference>, LinkError> {
        let mut order: Vec<&String> = Vec::with_capacity(names.len());
        for name in names {
            if !order.contains(&name) {
                order.push(name);
            }
        }

        let mut pending: Vec<String> = order
            .iter()
            .filter(|n| self.cached(n).is_none())
            .map(|n| n.to_string())
            .collect();

        for stage in &self.stages {
            if pending.is_empty() {
                break;
            }
            let found = stage.resolve(&pending, self)?;
            let mut bound = self.bound.write();
            for (name, address) in found {
                if pending.contains(&name) && !bound.contains_key(&name) {
                    log::debug!("{} stage bound '{name}' to {address:#x}", stage.stage());
                    bound.insert(name, (stage.stage(), address));
                }
            }
            // nested resolution may have bound some of ours already
            pending.retain(|n| !bound.contains_key(n));
        }

        Ok(order
            .into_iter()
            .map(|name| match self.cached(name) {
                Some((stage, address)) => SymbolReference::bound(name.as_str(), stage, address),
                None => SymbolReference::unbound(name.as_str()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Fixed {
        stage: ResolverStage,
        symbols: Vec<(&'static str, usize)>,
        asked: Mutex<Vec<Vec<String>>>,
    }

    impl Fixed {
        fn new(stage: ResolverStage, symbols: Vec<(&'static str, usize)>) -> Arc<Self> {
            Arc::new(Self {
                stage,
                symbols,
                asked: Mutex::new(Vec::new()),
            })
        }
    }

    impl SymbolResolver for Fixed {
        fn stage(&self) -> ResolverStage {
            self.stage
        }

        fn resolve(
            &self,
            names: &[String],
            _chain: &ResolverChain,
        ) -> Result<Vec<(String, usize)>, LinkError> {
            self.asked.lock().push(names.to_vec());
            Ok(self
                .symbols
                .iter()
                .filter(|(n, _)| names.iter().any(|m| m == n))
                .map(|(n, a)| (n.to_string(), *a))
                .collect())
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn first_stage_wins_and_later_stages_skip_bound_names() {
        let host = Fixed::new(ResolverStage::Host, vec![("puts", 0x10)]);
        let archive = Fixed::new(
            ResolverStage::ImportArchive,
            vec![("puts", 0x20), ("helper", 0x30)],
        );
        // pushed out of order on purpose
        let chain = ResolverChain::new()
            .with(Box::new(Arc::clone(&archive)))
            .with(Box::new(Arc::clone(&host)));
        assert_eq!(
            chain.stages(),
            [ResolverStage::Host, ResolverStage::ImportArchive]
        );

        let refs = chain.resolve(&names(&["puts", "helper", "missing", "puts"])).unwrap();
        assert_eq!(
            refs,
            vec![
                SymbolReference::bound("puts", ResolverStage::Host, 0x10),
                SymbolReference::bound("helper", ResolverStage::ImportArchive, 0x30),
                SymbolReference::unbound("missing"),
            ]
        );
        assert_eq!(archive.asked.lock()[0], names(&["helper", "missing"]));
    }

    #[test]
    fn bindings_are_cached() {
        let host = Fixed::new(ResolverStage::Host, vec![("abs", 0x44)]);
        let chain = ResolverChain::new().with(Box::new(Arc::clone(&host)));
        chain.resolve(&names(&["abs"])).unwrap();
        let refs = chain.resolve(&names(&["abs"])).unwrap();
        assert!(refs[0].is_bound());
        assert_eq!(host.asked.lock().len(), 1);
        assert_eq!(chain.cached("abs"), Some((ResolverStage::Host, 0x44)));
    }

    #[test]
    fn forgotten_bindings_are_resolved_again() {
        let host = Fixed::new(ResolverStage::Host, vec![("abs", 0x44), ("other", 0x48)]);
        let chain = ResolverChain::new().with(Box::new(Arc::clone(&host)));
        chain.resolve(&names(&["abs", "other"])).unwrap();

        // a stale address leaves the binding alone
        chain.forget([("abs", 0x44), ("other", 0x1000)]);
        assert_eq!(chain.cached("abs"), None);
        assert_eq!(chain.cached("other"), Some((ResolverStage::Host, 0x48)));

        chain.resolve(&names(&["abs"])).unwrap();
        assert_eq!(host.asked.lock().len(), 2);
    }

    #[test]
    fn empty_chain_binds_nothing() {
        let chain = ResolverChain::new();
        let refs = chain.resolve(&names(&["x"])).unwrap();
        assert!(!refs[0].is_bound());
        assert!(chain.resolve(&[]).unwrap().is_empty());
    }
}
