//! A single policy engine bound to one bundle.
//!
//! The instance owns the engine handle, its inter-query cache, the lazily
//! compiled prepared query and the startup/readiness state machine. All
//! instances are created and destroyed by the registry; request filters
//! only ever hold shared read handles.

use std::{
    fmt::Write as _,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, SystemTime},
};

use arc_swap::ArcSwap;
use log::{info, warn};
use opentelemetry::Context;
use rand::Rng;
use tokio::{sync::OnceCell, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    authz::{self, AuthzRequest, Decision},
    config::{template::EngineSettings, OpaConfig},
    engine::{
        cache::InterQueryCache, DecisionLogEntry, Engine, EngineError, EngineFactory,
        EngineOptions, EnginePlugin, EvalOptions, PreparedQuery, BUNDLE_PLUGIN, DISCOVERY_PLUGIN,
    },
    error::{OpaError, OpaResult, PluginFailure},
    trace::{self, OutboundTracer},
};

/// Grace period for engine teardown when no caller-supplied bound applies.
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of an instance. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Starting,
    Ready,
    Failed,
    Closing,
    Closed,
}

type QueryCell = OnceCell<Arc<dyn PreparedQuery>>;

/// One embedded policy engine bound to a single bundle.
pub struct Instance {
    bundle: String,
    settings: EngineSettings,
    engine: Arc<dyn Engine>,
    cache: Arc<InterQueryCache>,
    prepared: ArcSwap<QueryCell>,
    ids: DecisionIdGenerator,
    state: Mutex<InstanceState>,
    max_body_bytes: u64,
    body_read_chunk: usize,
}

impl Instance {
    /// Build the engine for `bundle` from the interpolated configuration
    /// template. The instance is not started yet.
    pub(crate) async fn new(
        bundle: &str,
        template: &str,
        config: &OpaConfig,
        factory: &Arc<dyn EngineFactory>,
    ) -> OpaResult<Arc<Self>> {
        let resolved = crate::config::template::interpolate(template, bundle)?;
        let settings = EngineSettings::parse(&resolved, config.enable_custom_control_loop)?;
        let outbound = Arc::new(OutboundTracer::new(bundle, settings.labels.clone()));
        let engine = factory
            .new_engine(EngineOptions {
                bundle: bundle.to_string(),
                config: settings.config_bytes(),
                outbound,
            })
            .await
            .map_err(|e| OpaError::StartupFatal {
                bundle: bundle.to_string(),
                cause: e.to_string(),
            })?;

        let instance = Arc::new(Self {
            bundle: bundle.to_string(),
            settings,
            engine,
            cache: Arc::new(InterQueryCache::default()),
            prepared: ArcSwap::from_pointee(QueryCell::new()),
            ids: DecisionIdGenerator::default(),
            state: Mutex::new(InstanceState::Created),
            max_body_bytes: config.max_request_body_bytes,
            body_read_chunk: config.body_read_buffer_size,
        });

        let weak: Weak<Instance> = Arc::downgrade(&instance);
        instance.engine.on_compiler_update(Box::new(move || {
            if let Some(instance) = weak.upgrade() {
                instance.invalidate_prepared();
            }
        }));

        Ok(instance)
    }

    pub fn bundle(&self) -> &str {
        &self.bundle
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn max_body_bytes(&self) -> u64 {
        self.max_body_bytes
    }

    pub fn body_read_chunk(&self) -> usize {
        self.body_read_chunk
    }

    pub fn state(&self) -> InstanceState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: InstanceState) {
        *self.state.lock().unwrap() = next;
    }

    /// Start the plugin manager and poll plugin readiness until every
    /// plugin reports OK or the deadline expires. On timeout the instance
    /// is closed and the non-OK plugins are enumerated in the error.
    pub(crate) async fn start(&self, timeout: Duration) -> OpaResult<()> {
        self.set_state(InstanceState::Starting);
        if let Err(e) = self.engine.start().await {
            self.fail_startup().await;
            return Err(OpaError::StartupFatal {
                bundle: self.bundle.clone(),
                cause: e.to_string(),
            });
        }
        let deadline = Instant::now() + timeout;
        loop {
            let statuses = self.engine.plugin_status();
            if statuses.values().all(|s| s.ok) {
                self.set_state(InstanceState::Ready);
                info!("instance for bundle '{}' is ready", self.bundle);
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                let plugins: Vec<PluginFailure> = statuses
                    .iter()
                    .filter(|(_, status)| !status.ok)
                    .map(|(name, status)| PluginFailure {
                        name: name.clone(),
                        message: status.message.clone(),
                    })
                    .collect();
                for failure in &plugins {
                    warn!(
                        "bundle '{}' startup: plugin not ready: {failure}",
                        self.bundle
                    );
                }
                self.fail_startup().await;
                return Err(OpaError::StartupTimeout {
                    bundle: self.bundle.clone(),
                    plugins,
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Custom-control-loop startup: start the plugin manager, then drive
    /// the discovery (optional) and bundle (mandatory) triggers with
    /// exponential backoff on retryable errors, bounded by `timeout`.
    pub(crate) async fn start_and_trigger(&self, timeout: Duration) -> OpaResult<()> {
        self.set_state(InstanceState::Starting);
        if let Err(e) = self.engine.start().await {
            self.fail_startup().await;
            return Err(OpaError::StartupFatal {
                bundle: self.bundle.clone(),
                cause: e.to_string(),
            });
        }
        let deadline = Instant::now() + timeout;

        if let Some(discovery) = self.engine.plugin(DISCOVERY_PLUGIN) {
            if let Err(e) = self
                .trigger_with_backoff(discovery.as_ref(), DISCOVERY_PLUGIN, deadline)
                .await
            {
                self.fail_startup().await;
                return Err(e);
            }
        }

        let Some(bundle_plugin) = self.engine.plugin(BUNDLE_PLUGIN) else {
            self.fail_startup().await;
            return Err(OpaError::StartupFatal {
                bundle: self.bundle.clone(),
                cause: "engine configuration has no bundle plugin".to_string(),
            });
        };
        if let Err(e) = self
            .trigger_with_backoff(bundle_plugin.as_ref(), BUNDLE_PLUGIN, deadline)
            .await
        {
            self.fail_startup().await;
            return Err(e);
        }

        let statuses = self.engine.plugin_status();
        let plugins: Vec<PluginFailure> = statuses
            .iter()
            .filter(|(_, status)| !status.ok)
            .map(|(name, status)| PluginFailure {
                name: name.clone(),
                message: status.message.clone(),
            })
            .collect();
        if !plugins.is_empty() {
            for failure in &plugins {
                warn!(
                    "bundle '{}' startup: plugin not ready after trigger: {failure}",
                    self.bundle
                );
            }
            self.fail_startup().await;
            return Err(OpaError::StartupTimeout {
                bundle: self.bundle.clone(),
                plugins,
            });
        }

        self.set_state(InstanceState::Ready);
        info!("instance for bundle '{}' is ready", self.bundle);
        Ok(())
    }

    async fn trigger_with_backoff(
        &self,
        plugin: &dyn EnginePlugin,
        name: &str,
        deadline: Instant,
    ) -> OpaResult<()> {
        let mut backoff = RETRY_INITIAL_BACKOFF;
        let mut last: Option<EngineError> = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.retry_exhausted(name, last));
            }
            match tokio::time::timeout(remaining, plugin.trigger()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) if err.is_retryable() => {
                    warn!(
                        "bundle '{}': retrying '{name}' trigger: {err}",
                        self.bundle
                    );
                    last = Some(err);
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if backoff >= remaining {
                        return Err(self.retry_exhausted(name, last));
                    }
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Ok(Err(err)) => {
                    return Err(OpaError::StartupFatal {
                        bundle: self.bundle.clone(),
                        cause: format!("'{name}' trigger failed: {err}"),
                    });
                }
                Err(_) => return Err(self.retry_exhausted(name, last)),
            }
        }
    }

    fn retry_exhausted(&self, name: &str, last: Option<EngineError>) -> OpaError {
        OpaError::StartupRetryableExhausted {
            bundle: self.bundle.clone(),
            last: last
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("'{name}' trigger timed out")),
        }
    }

    /// One periodic refresh round: trigger discovery (when registered) and
    /// bundle once each, stopping at the first error. No-op once the
    /// instance is shutting down.
    pub(crate) async fn trigger_plugins(&self) -> OpaResult<()> {
        if matches!(
            self.state(),
            InstanceState::Closing | InstanceState::Closed
        ) {
            return Ok(());
        }
        for name in [DISCOVERY_PLUGIN, BUNDLE_PLUGIN] {
            if let Some(plugin) = self.engine.plugin(name) {
                plugin
                    .trigger()
                    .await
                    .map_err(|e| OpaError::Engine(format!("'{name}' trigger failed: {e}")))?;
            }
        }
        Ok(())
    }

    async fn fail_startup(&self) {
        self.set_state(InstanceState::Failed);
        self.close(DEFAULT_SHUTDOWN_GRACE_PERIOD).await;
    }

    /// Stop the engine under `grace`. Idempotent; the engine is stopped at
    /// most once.
    pub async fn close(&self, grace: Duration) {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, InstanceState::Closing | InstanceState::Closed) {
                return;
            }
            *state = InstanceState::Closing;
        }
        if tokio::time::timeout(grace, self.engine.stop()).await.is_err() {
            warn!(
                "engine for bundle '{}' did not stop within {grace:?}",
                self.bundle
            );
        }
        self.set_state(InstanceState::Closed);
    }

    /// Evaluate the policy against one adapted request.
    ///
    /// Every call, including failed and cancelled ones, produces exactly
    /// one decision-log record.
    pub async fn eval(
        &self,
        cancel: &CancellationToken,
        cx: &Context,
        req: &AuthzRequest<'_>,
    ) -> OpaResult<Decision> {
        let decision_id = self.ids.next();
        trace::record_decision_id(cx, &decision_id);
        let timestamp = SystemTime::now();

        let mut input = None;
        let raw = self
            .eval_query(cancel, cx, req, &decision_id, &mut input)
            .await;

        let entry = DecisionLogEntry {
            decision_id,
            bundle: self.bundle.clone(),
            timestamp,
            labels: self.settings.labels.clone(),
            input,
            result: raw.as_ref().ok().cloned(),
            error: raw.as_ref().err().map(ToString::to_string),
        };
        if let Err(e) = self.engine.log_decision(entry) {
            warn!(
                "decision log hook failed for bundle '{}': {e}",
                self.bundle
            );
        }

        authz::parse_decision(&raw?)
    }

    async fn eval_query(
        &self,
        cancel: &CancellationToken,
        cx: &Context,
        req: &AuthzRequest<'_>,
        decision_id: &str,
        input_out: &mut Option<serde_json::Value>,
    ) -> OpaResult<serde_json::Value> {
        if cancel.is_cancelled() {
            return Err(OpaError::EvalCanceled(
                "timeout before query execution".to_string(),
            ));
        }
        let input = authz::build_input(req)?;
        *input_out = Some(input.clone());
        let query = self.prepared_query().await?;
        let opts = EvalOptions {
            decision_id,
            cache: &self.cache,
            trace: cx,
        };
        query.eval(&input, opts).await.map_err(OpaError::from)
    }

    /// The prepared query for the current compiler generation. Built once
    /// per generation; concurrent callers during a rebuild wait for the
    /// single in-flight compilation.
    async fn prepared_query(&self) -> OpaResult<Arc<dyn PreparedQuery>> {
        let cell = self.prepared.load_full();
        let query = cell
            .get_or_try_init(|| async { self.engine.prepare_query(&self.settings.query()).await })
            .await
            .map_err(OpaError::from)?;
        Ok(Arc::clone(query))
    }

    /// Discard the prepared query. In-flight evaluations holding the old
    /// one run to completion; the next evaluation rebuilds.
    fn invalidate_prepared(&self) {
        self.prepared.store(Arc::new(QueryCell::new()));
    }
}

/// Monotonic 32-byte decision-id generator: 24 random bytes plus a
/// big-endian sequence number, hex encoded.
#[derive(Default)]
struct DecisionIdGenerator {
    counter: AtomicU64,
}

impl DecisionIdGenerator {
    fn next(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes[..24]);
        bytes[24..].copy_from_slice(&seq.to_be_bytes());
        let mut id = String::with_capacity(64);
        for byte in bytes {
            let _ = write!(&mut id, "{byte:02x}");
        }
        id
    }
}
