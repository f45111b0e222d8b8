use crate::errors::LoaderError;
use crate::registry::{Registry, Require};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tracing::{debug, info, warn};

/// Error surfaced by a fetcher; stringified into `BundleLoadFailed`.
pub type FetchError = Box<dyn std::error::Error + Send + Sync>;

pub type FetchFuture = Pin<Box<dyn Future<Output = std::result::Result<(), FetchError>> + Send>>;

/// The script-injection seam.
///
/// A fetcher brings a bundle's `define` calls into the registry and
/// resolves once they have run; in a browser this is a script tag, in a
/// native host whatever evaluates the chunk text. The registry starts at
/// most one fetch per URL, ever.
pub trait BundleFetcher: Send + Sync + 'static {
    fn fetch(&self, url: &str, registry: Registry) -> FetchFuture;
}

pub(crate) type BundleCallback = Box<dyn FnOnce(Require) + Send>;

enum BundleState {
    Pending,
    Loaded,
    Failed(LoaderError),
}

/// One URL's lifecycle. The state transition is monotonic and terminal;
/// waiters are drained exactly once, when `Pending` is left.
pub(crate) struct BundleEntry {
    state: BundleState,
    waiters: Vec<BundleCallback>,
    wakers: Vec<Waker>,
}

impl Registry {
    /// Fetch a bundle by URL, once. The returned future resolves when the
    /// bundle's `define` calls have run, and rejects with
    /// `BundleLoadFailed` if the fetch failed — on this or any earlier
    /// call: a failed URL stays failed.
    ///
    /// Must be called within a tokio runtime; the fetch runs as a spawned
    /// task and is never cancelled.
    pub fn ensure_bundle(&self, url: &str) -> BundleCompletion {
        self.ensure_inner(url, None)
    }

    /// Like [`ensure_bundle`](Self::ensure_bundle), additionally invoking
    /// `callback` with the bound require once the bundle is loaded —
    /// immediately when it already is. On failure the callback is dropped
    /// without being invoked; the completion future carries the rejection.
    pub fn ensure_bundle_with(
        &self,
        url: &str,
        callback: impl FnOnce(Require) + Send + 'static,
    ) -> BundleCompletion {
        self.ensure_inner(url, Some(Box::new(callback)))
    }

    fn ensure_inner(&self, url: &str, callback: Option<BundleCallback>) -> BundleCompletion {
        let mut start_fetch = false;
        let mut invoke_now = None;
        {
            let mut tables = self.tables();
            match tables.bundles.get_mut(url) {
                Some(entry) => match entry.state {
                    BundleState::Pending => {
                        if let Some(callback) = callback {
                            entry.waiters.push(callback);
                        }
                    }
                    BundleState::Loaded => invoke_now = callback,
                    BundleState::Failed(_) => {}
                },
                None => {
                    // Recorded before the fetch begins, so a re-entrant call
                    // during creation joins this entry.
                    let mut waiters = Vec::new();
                    if let Some(callback) = callback {
                        waiters.push(callback);
                    }
                    tables.bundles.insert(
                        url.to_string(),
                        BundleEntry {
                            state: BundleState::Pending,
                            waiters,
                            wakers: Vec::new(),
                        },
                    );
                    start_fetch = true;
                }
            }
        }

        if let Some(callback) = invoke_now {
            callback(self.bound());
        }
        if start_fetch {
            debug!(url, "fetching bundle");
            let registry = self.clone();
            let fetcher = self.fetcher();
            let url = url.to_string();
            tokio::spawn(async move {
                let result = fetcher.fetch(&url, registry.clone()).await;
                registry.finish_bundle(&url, result);
            });
        }

        BundleCompletion {
            registry: self.clone(),
            url: url.to_string(),
        }
    }

    fn finish_bundle(&self, url: &str, result: std::result::Result<(), FetchError>) {
        let (waiters, wakers) = {
            let mut tables = self.tables();
            let Some(entry) = tables.bundles.get_mut(url) else {
                return;
            };
            entry.state = match &result {
                Ok(()) => BundleState::Loaded,
                Err(reason) => BundleState::Failed(LoaderError::BundleLoadFailed {
                    url: url.to_string(),
                    reason: reason.to_string(),
                }),
            };
            (
                std::mem::take(&mut entry.waiters),
                std::mem::take(&mut entry.wakers),
            )
        };

        match result {
            Ok(()) => {
                info!(url, waiters = waiters.len(), "bundle loaded");
                // FIFO, outside the lock: a waiter may itself ensure bundles.
                for waiter in waiters {
                    waiter(self.bound());
                }
            }
            Err(reason) => {
                // Waiters get no call on failure; the future is the signal.
                warn!(url, error = %reason, "bundle failed");
                drop(waiters);
            }
        }
        for waker in wakers {
            waker.wake();
        }
    }
}

/// Completion of a bundle fetch: a single-completion future over the bundle
/// table. Every completion obtained for one URL resolves or rejects
/// identically, however late it was requested.
pub struct BundleCompletion {
    registry: Registry,
    url: String,
}

impl Future for BundleCompletion {
    type Output = std::result::Result<(), LoaderError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut tables = self.registry.tables();
        let Some(entry) = tables.bundles.get_mut(&self.url) else {
            return Poll::Ready(Err(LoaderError::BundleLoadFailed {
                url: self.url.clone(),
                reason: "bundle was never requested".to_string(),
            }));
        };
        match &entry.state {
            BundleState::Loaded => Poll::Ready(Ok(())),
            BundleState::Failed(error) => Poll::Ready(Err(error.clone())),
            BundleState::Pending => {
                if !entry.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    entry.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

/// The host's script evaluator: receives the fetched chunk text and must
/// issue its `define` calls against the registry before returning.
pub type ScriptEvaluator =
    Arc<dyn Fn(&str, &Registry) -> std::result::Result<(), FetchError> + Send + Sync>;

/// Stock fetcher for native hosts: GET the chunk text over HTTP and hand it
/// to the host's evaluator.
pub struct HttpFetcher {
    client: reqwest::Client,
    evaluate: ScriptEvaluator,
}

impl HttpFetcher {
    pub fn new(evaluate: ScriptEvaluator) -> Self {
        Self {
            client: reqwest::Client::new(),
            evaluate,
        }
    }
}

impl BundleFetcher for HttpFetcher {
    fn fetch(&self, url: &str, registry: Registry) -> FetchFuture {
        let client = self.client.clone();
        let evaluate = self.evaluate.clone();
        let url = url.to_string();
        Box::pin(async move {
            let response = client.get(&url).send().await?.error_for_status()?;
            let body = response.text().await?;
            evaluate(&body, &registry)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Defines `foo@1.2.3` when released; optionally fails instead.
    struct GatedFetcher {
        calls: Arc<AtomicUsize>,
        gate: Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
        fail: bool,
    }

    impl GatedFetcher {
        fn ungated(calls: Arc<AtomicUsize>, fail: bool) -> Self {
            Self {
                calls,
                gate: Mutex::new(None),
                fail,
            }
        }
    }

    impl BundleFetcher for GatedFetcher {
        fn fetch(&self, _url: &str, registry: Registry) -> FetchFuture {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.lock().unwrap().take();
            let fail = self.fail;
            Box::pin(async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                if fail {
                    return Err("script error".into());
                }
                registry.define(
                    "foo@1.2.3",
                    Arc::new(|_module, exports, _require| {
                        exports.set("v", "1.2.3".to_string());
                    }),
                )?;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn concurrent_ensures_share_one_fetch_and_drain_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, gate) = tokio::sync::oneshot::channel();
        let registry = Registry::new(GatedFetcher {
            calls: calls.clone(),
            gate: Mutex::new(Some(gate)),
            fail: false,
        });

        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let first = registry.ensure_bundle_with("x.js", move |_require| {
            seen.lock().unwrap().push("a");
        });
        let seen = order.clone();
        let second = registry.ensure_bundle_with("x.js", move |_require| {
            seen.lock().unwrap().push("b");
        });

        release.send(()).unwrap();
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
        assert!(registry.require("foo@^1.0.0").is_ok());
    }

    #[tokio::test]
    async fn late_ensure_of_a_loaded_bundle_runs_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Registry::new(GatedFetcher::ungated(calls.clone(), false));

        registry.ensure_bundle("x.js").await.unwrap();

        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let completion = registry.ensure_bundle_with("x.js", move |_require| {
            flag.store(true, Ordering::SeqCst);
        });
        // Invoked before the completion is even polled.
        assert!(invoked.load(Ordering::SeqCst));
        completion.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_terminal_and_skips_waiters() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Registry::new(GatedFetcher::ungated(calls.clone(), true));

        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let error = registry
            .ensure_bundle_with("x.js", move |_require| {
                flag.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap_err();
        match &error {
            LoaderError::BundleLoadFailed { url, reason } => {
                assert_eq!(url, "x.js");
                assert!(reason.contains("script error"));
            }
            other => panic!("expected BundleLoadFailed, got {other:?}"),
        }
        assert!(!invoked.load(Ordering::SeqCst));

        // The entry is not recreated: same rejection, no second fetch.
        let again = registry.ensure_bundle("x.js").await.unwrap_err();
        assert_eq!(again, error);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiters_may_ensure_further_bundles() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Registry::new(GatedFetcher::ungated(calls.clone(), false));

        let completion = registry.ensure_bundle_with("x.js", |require| {
            // The bound require carries ensure; a waiter chains the next
            // bundle without deadlocking the drain.
            let _ = require.ensure("y.js");
        });
        completion.await.unwrap();
        registry.ensure_bundle("y.js").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
