//! Route pre/post-processing.
//!
//! The host hands its active route set to these hooks on every (re)load.
//! The pre-processor preloads instances referenced by new routes; the
//! post-processor marks the no-longer-referenced ones idle so the cleaner
//! can reclaim them.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use log::warn;
use tokio::sync::mpsc;

use crate::registry::Registry;

/// One filter reference inside a route definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRef {
    pub name: String,
    pub args: Vec<String>,
}

impl FilterRef {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// The slice of a host route the integration cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDef {
    pub id: String,
    pub filters: Vec<FilterRef>,
}

/// Filters belonging to this integration start with this prefix; their
/// first argument is the bundle name.
pub const OPA_FILTER_PREFIX: &str = "opa";

/// Bundle names referenced by `routes`, de-duplicated in first-seen order.
pub fn referenced_bundles(routes: &[RouteDef]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut bundles = Vec::new();
    for route in routes {
        for filter in &route.filters {
            if !filter.name.starts_with(OPA_FILTER_PREFIX) {
                continue;
            }
            if let Some(bundle) = filter.args.first() {
                if !bundle.is_empty() && seen.insert(bundle.clone()) {
                    bundles.push(bundle.clone());
                }
            }
        }
    }
    bundles
}

/// Preloads instances referenced by incoming route definitions.
///
/// The first activation starts all referenced instances in parallel and
/// waits for them; later activations enqueue newly referenced bundles to a
/// sequential background worker, bounding control-plane load during rolling
/// route updates. Start failures are logged and never abort a route load.
pub struct PreProcessor {
    registry: Arc<Registry>,
    last_seen: Mutex<HashSet<String>>,
    first_done: AtomicBool,
    tx: mpsc::UnboundedSender<String>,
}

impl PreProcessor {
    pub(crate) fn new(registry: Arc<Registry>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let worker_registry = Arc::clone(&registry);
        let quit = registry.quit_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = quit.cancelled() => break,
                    bundle = rx.recv() => match bundle {
                        Some(bundle) => {
                            if let Err(e) = worker_registry.get_or_start(&bundle).await {
                                warn!("preloading instance for bundle '{bundle}' failed: {e}");
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        Self {
            registry,
            last_seen: Mutex::new(HashSet::new()),
            first_done: AtomicBool::new(false),
            tx,
        }
    }

    /// Called by the host whenever route definitions are (re)loaded.
    pub async fn process(&self, routes: &[RouteDef]) {
        if !self.registry.config().preloading_enabled {
            return;
        }
        let bundles = referenced_bundles(routes);
        let fresh: Vec<String> = {
            let mut last = self.last_seen.lock().unwrap();
            let fresh = bundles
                .iter()
                .filter(|bundle| !last.contains(*bundle))
                .cloned()
                .collect();
            *last = bundles.into_iter().collect();
            fresh
        };

        if !self.first_done.swap(true, Ordering::SeqCst) {
            let results = futures::future::join_all(
                fresh.iter().map(|bundle| self.registry.get_or_start(bundle)),
            )
            .await;
            for (bundle, result) in fresh.iter().zip(results) {
                if let Err(e) = result {
                    warn!("preloading instance for bundle '{bundle}' failed: {e}");
                }
            }
        } else {
            for bundle in fresh {
                let _ = self.tx.send(bundle);
            }
        }
    }
}

/// Marks instances unreferenced by the activated route set so the cleaner
/// can reclaim them after the reuse window.
pub struct PostProcessor {
    registry: Arc<Registry>,
}

impl PostProcessor {
    pub(crate) fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Called by the host after a route set has been activated.
    pub fn process(&self, routes: &[RouteDef]) {
        let in_use: HashSet<String> = referenced_bundles(routes).into_iter().collect();
        self.registry.mark_unused(&in_use);
    }
}
