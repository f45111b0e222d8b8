use crate::bundles::{BundleCompletion, BundleEntry, BundleFetcher};
use crate::errors::{LoaderError, Result};
use crate::exports::{Exports, ModuleInstance};
use mosaic_core::VersionedPath;
use rustc_hash::FxHashMap;
use semver::Version;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// A module factory, invoked at most once with the module instance, its
/// exports object and the registry-bound require.
pub type ModuleFactory = Arc<dyn Fn(&ModuleInstance, &Exports, &Require) + Send + Sync>;

pub(crate) struct ModuleEntry {
    pub(crate) path: VersionedPath,
    pub(crate) version: Version,
    pub(crate) factory: ModuleFactory,
    pub(crate) instance: Option<Arc<ModuleInstance>>,
}

/// The four process-wide tables of one registry instance. Entries are only
/// ever inserted, never removed or replaced.
#[derive(Default)]
pub(crate) struct Tables {
    pub(crate) modules: BTreeMap<String, ModuleEntry>,
    pub(crate) resolutions: FxHashMap<String, String>,
    pub(crate) bundles: FxHashMap<String, BundleEntry>,
}

struct RegistryInner {
    tables: Mutex<Tables>,
    fetcher: Arc<dyn BundleFetcher>,
}

/// The runtime module registry.
///
/// Chunks `define` factories under exact-version paths; hosts `require`
/// ranged paths, which resolve to the maximally satisfying registered
/// version. Cloning is cheap and every clone shares the same tables; for
/// isolation, create separate registries.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new(fetcher: impl BundleFetcher) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tables: Mutex::new(Tables::default()),
                fetcher: Arc::new(fetcher),
            }),
        }
    }

    /// The stable require handle passed to factories and bundle waiters.
    pub fn bound(&self) -> Require {
        Require {
            registry: self.clone(),
        }
    }

    /// Record `factory` under an exact-version path.
    ///
    /// Redefinition of an already-known path is a no-op: overlapping copies
    /// of a shared library carried by independently built chunks coexist,
    /// first writer wins. A path that does not parse, or whose version is a
    /// range rather than an exact version, is rejected.
    pub fn define(&self, path: &str, factory: ModuleFactory) -> Result<()> {
        let parsed =
            VersionedPath::parse(path).ok_or_else(|| LoaderError::BadPath(path.to_string()))?;
        let version = parsed
            .exact_version()
            .ok_or_else(|| LoaderError::BadPath(path.to_string()))?;
        let id = parsed.to_string();

        let mut tables = self.tables();
        if tables.modules.contains_key(&id) {
            debug!(module = %id, "redefinition ignored");
            return Ok(());
        }
        debug!(module = %id, "module defined");
        tables.modules.insert(
            id,
            ModuleEntry {
                path: parsed,
                version,
                factory,
                instance: None,
            },
        );
        Ok(())
    }

    /// Resolve a ranged path and return the module's exports, instantiating
    /// it on first use.
    pub fn require(&self, path: &str) -> Result<Arc<Exports>> {
        let require = self.bound();
        self.require_with(path, &require)
    }

    /// True when an exact-version path is already defined.
    pub fn is_registered(&self, path: &str) -> bool {
        self.tables().modules.contains_key(path)
    }

    /// All registered exact-version paths, in sorted order.
    pub fn registered_paths(&self) -> Vec<String> {
        self.tables().modules.keys().cloned().collect()
    }

    pub(crate) fn require_with(&self, path: &str, require: &Require) -> Result<Arc<Exports>> {
        let (instance, factory) = {
            let mut tables = self.tables();
            let id = resolve(&mut tables, path)?;
            let Some(entry) = tables.modules.get_mut(&id) else {
                return Err(LoaderError::NoMatch(path.to_string()));
            };
            if let Some(instance) = &entry.instance {
                return Ok(instance.exports.clone());
            }
            // Insert the instance before running the factory, so a cyclic
            // require during execution observes the same exports object.
            let instance = ModuleInstance::new(id);
            entry.instance = Some(instance.clone());
            (instance, entry.factory.clone())
        };

        factory(&instance, &instance.exports, require);
        instance.mark_loaded();
        debug!(module = %instance.id, "module instantiated");
        Ok(instance.exports.clone())
    }

    pub(crate) fn tables(&self) -> MutexGuard<'_, Tables> {
        self.inner
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn fetcher(&self) -> Arc<dyn BundleFetcher> {
        self.inner.fetcher.clone()
    }
}

/// Resolution: cache lookup, then candidate scan over `(pkg, sub)` matches,
/// then maximal satisfying version. Only successes are memoised, so a
/// failed require does not block a later one from succeeding against the
/// same (grown) registry.
fn resolve(tables: &mut Tables, path: &str) -> Result<String> {
    if let Some(id) = tables.resolutions.get(path) {
        return Ok(id.clone());
    }

    let request =
        VersionedPath::parse(path).ok_or_else(|| LoaderError::BadPath(path.to_string()))?;
    let range = request
        .version_req()
        .ok_or_else(|| LoaderError::BadPath(path.to_string()))?;

    let mut best: Option<(&Version, &str)> = None;
    let mut matched_any = false;
    for (id, entry) in &tables.modules {
        if entry.path.pkg != request.pkg || entry.path.sub != request.sub {
            continue;
        }
        matched_any = true;
        if !range.matches(&entry.version) {
            continue;
        }
        if best.map(|(version, _)| version < &entry.version).unwrap_or(true) {
            best = Some((&entry.version, id.as_str()));
        }
    }

    let Some((_, id)) = best else {
        if !matched_any {
            return Err(LoaderError::NoMatch(path.to_string()));
        }
        let available = tables
            .modules
            .values()
            .filter(|entry| entry.path.pkg == request.pkg && entry.path.sub == request.sub)
            .map(|entry| entry.version.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(LoaderError::NoSatisfying {
            request: path.to_string(),
            available,
        });
    };

    let id = id.to_string();
    debug!(request = path, resolved = %id, "resolved module request");
    tables.resolutions.insert(path.to_string(), id.clone());
    Ok(id)
}

/// The bound require handle: `require` plus `ensure`, the two operations a
/// rewritten module body issues through a single name.
#[derive(Clone)]
pub struct Require {
    registry: Registry,
}

impl Require {
    pub fn require(&self, path: &str) -> Result<Arc<Exports>> {
        self.registry.require_with(path, self)
    }

    pub fn ensure(&self, url: &str) -> BundleCompletion {
        self.registry.ensure_bundle(url)
    }

    pub fn ensure_with(
        &self,
        url: &str,
        callback: impl FnOnce(Require) + Send + 'static,
    ) -> BundleCompletion {
        self.registry.ensure_bundle_with(url, callback)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundles::FetchFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoFetch;

    impl BundleFetcher for NoFetch {
        fn fetch(&self, _url: &str, _registry: Registry) -> FetchFuture {
            Box::pin(async { Err("fetching is not exercised by this test".into()) })
        }
    }

    fn registry() -> Registry {
        Registry::new(NoFetch)
    }

    fn version_module(version: &str) -> ModuleFactory {
        let version = version.to_string();
        Arc::new(move |_module, exports, _require| {
            exports.set("v", version.clone());
        })
    }

    fn required_version(registry: &Registry, path: &str) -> String {
        registry
            .require(path)
            .unwrap()
            .get_as::<String>("v")
            .unwrap()
            .as_ref()
            .clone()
    }

    #[test]
    fn resolves_the_maximally_satisfying_version() {
        let registry = registry();
        registry.define("foo@1.0.0", version_module("1.0.0")).unwrap();
        registry.define("foo@1.2.3", version_module("1.2.3")).unwrap();

        assert_eq!(required_version(&registry, "foo@^1.0.0"), "1.2.3");
        assert_eq!(required_version(&registry, "foo@~1.0.0"), "1.0.0");
    }

    #[test]
    fn unknown_package_is_no_match() {
        let registry = registry();
        registry.define("foo@1.2.3", version_module("1.2.3")).unwrap();

        assert_eq!(
            registry.require("bar@^1.0.0").unwrap_err(),
            LoaderError::NoMatch("bar@^1.0.0".to_string())
        );
    }

    #[test]
    fn unsatisfied_range_reports_available_versions() {
        let registry = registry();
        registry.define("foo@1.2.3", version_module("1.2.3")).unwrap();

        match registry.require("foo@^2.0.0").unwrap_err() {
            LoaderError::NoSatisfying { request, available } => {
                assert_eq!(request, "foo@^2.0.0");
                assert_eq!(available, "1.2.3");
            }
            other => panic!("expected NoSatisfying, got {other:?}"),
        }
    }

    #[test]
    fn subpath_is_part_of_the_match_key() {
        let registry = registry();
        registry
            .define("foo@1.0.0/lib/a.js", version_module("1.0.0"))
            .unwrap();

        assert!(matches!(
            registry.require("foo@^1.0.0").unwrap_err(),
            LoaderError::NoMatch(_)
        ));
        assert!(registry.require("foo@^1.0.0/lib/a.js").is_ok());
    }

    #[test]
    fn define_is_first_writer_wins_and_factories_run_once() {
        let registry = registry();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        registry
            .define(
                "foo@1.0.0",
                Arc::new(move |_module, exports, _require| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    exports.set("v", "first".to_string());
                }),
            )
            .unwrap();
        let counter = second.clone();
        registry
            .define(
                "foo@1.0.0",
                Arc::new(move |_module, _exports, _require| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        for _ in 0..3 {
            assert_eq!(required_version(&registry, "foo@^1.0.0"), "first");
        }
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn require_returns_the_same_exports_by_identity() {
        let registry = registry();
        registry.define("foo@1.2.3", version_module("1.2.3")).unwrap();

        let a = registry.require("foo@^1.0.0").unwrap();
        let b = registry.require("foo@^1.0.0").unwrap();
        let c = registry.require("foo@~1.2.0").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn resolutions_are_memoised() {
        let registry = registry();
        registry.define("foo@1.0.0", version_module("1.0.0")).unwrap();
        let before = registry.require("foo@^1.0.0").unwrap();

        // A better version registered later does not disturb an already
        // memoised resolution.
        registry.define("foo@1.5.0", version_module("1.5.0")).unwrap();
        let after = registry.require("foo@^1.0.0").unwrap();
        assert!(Arc::ptr_eq(&before, &after));

        // A fresh request string resolves against the grown registry.
        assert_eq!(required_version(&registry, "foo@~1.5.0"), "1.5.0");
    }

    #[test]
    fn failed_resolution_does_not_poison_the_cache() {
        let registry = registry();
        registry.define("foo@1.2.3", version_module("1.2.3")).unwrap();

        assert!(registry.require("foo@^2.0.0").is_err());
        registry.define("foo@2.1.0", version_module("2.1.0")).unwrap();
        assert_eq!(required_version(&registry, "foo@^2.0.0"), "2.1.0");
    }

    #[test]
    fn malformed_paths_are_rejected() {
        let registry = registry();
        assert!(matches!(
            registry.require("not a path").unwrap_err(),
            LoaderError::BadPath(_)
        ));
        // Definition requires an exact version, not a range.
        assert!(matches!(
            registry.define("foo@^1.0.0", version_module("")).unwrap_err(),
            LoaderError::BadPath(_)
        ));
    }

    #[test]
    fn cyclic_requires_share_identity_and_tolerate_partial_exports() {
        let registry = registry();

        registry
            .define(
                "a@1.0.0",
                Arc::new(|module, exports, require| {
                    assert!(!module.loaded());
                    exports.set("name", "a".to_string());
                    let b = require.require("b@^1.0.0").unwrap();
                    assert_eq!(b.get_as::<bool>("saw_partner").as_deref(), Some(&true));
                    exports.set("late", true);
                }),
            )
            .unwrap();
        registry
            .define(
                "b@1.0.0",
                Arc::new(|_module, exports, require| {
                    let a = require.require("a@~1.0.0").unwrap();
                    // Mid-cycle view of the partner: assigned slots are
                    // visible, unassigned ones read as None.
                    assert_eq!(a.get_as::<String>("name").as_deref().map(String::as_str), Some("a"));
                    assert!(a.get("late").is_none());
                    exports.set("saw_partner", true);
                }),
            )
            .unwrap();

        let a = registry.require("a@^1.0.0").unwrap();
        assert!(a.get_as::<bool>("late").is_some());

        // The exports object b observed mid-cycle is the finished one.
        let again = registry.require("a@~1.0.0").unwrap();
        assert!(Arc::ptr_eq(&a, &again));
    }

    #[test]
    fn introspection_lists_registered_paths() {
        let registry = registry();
        registry.define("foo@1.0.0", version_module("1.0.0")).unwrap();
        registry
            .define("@scope/bar@2.0.0/lib/b.js", version_module("2.0.0"))
            .unwrap();

        assert!(registry.is_registered("foo@1.0.0"));
        assert!(!registry.is_registered("foo@1.0.1"));
        assert_eq!(
            registry.registered_paths(),
            vec!["@scope/bar@2.0.0/lib/b.js".to_string(), "foo@1.0.0".to_string()]
        );
    }
}
