//! In-memory engine used by the crate's tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use super::{
    DecisionLogEntry, Engine, EngineError, EngineFactory, EngineOptions, EnginePlugin,
    EvalOptions, PluginStatus, PreparedQuery, BUNDLE_PLUGIN,
};

/// Scripted plugin: pops pre-seeded results, then falls back to a default.
pub(crate) struct MockPlugin {
    script: Mutex<VecDeque<Result<(), EngineError>>>,
    default: Mutex<Result<(), EngineError>>,
    pub triggers: AtomicUsize,
}

impl MockPlugin {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(Ok(())),
            triggers: AtomicUsize::new(0),
        })
    }

    pub fn push_result(&self, result: Result<(), EngineError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn set_default(&self, result: Result<(), EngineError>) {
        *self.default.lock().unwrap() = result;
    }

    pub fn trigger_count(&self) -> usize {
        self.triggers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnginePlugin for MockPlugin {
    async fn trigger(&self) -> Result<(), EngineError> {
        self.triggers.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.script.lock().unwrap().pop_front() {
            return result;
        }
        self.default.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct MockState {
    decision: Mutex<JsonValue>,
    eval_error: Mutex<Option<EngineError>>,
    evals: AtomicUsize,
}

/// Scriptable [`Engine`] implementation.
pub(crate) struct MockEngine {
    pub bundle: String,
    plugins: Mutex<HashMap<String, Arc<MockPlugin>>>,
    statuses: Mutex<HashMap<String, PluginStatus>>,
    hooks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    state: Arc<MockState>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub prepares: AtomicUsize,
    prepare_delay: Mutex<Option<Duration>>,
    logs: Mutex<Vec<DecisionLogEntry>>,
    fail_decision_log: Mutex<bool>,
}

impl MockEngine {
    /// An engine with a healthy bundle plugin that allows everything.
    pub fn ready(bundle: &str) -> Arc<Self> {
        let engine = Arc::new(Self {
            bundle: bundle.to_string(),
            plugins: Mutex::new(HashMap::from([(
                BUNDLE_PLUGIN.to_string(),
                MockPlugin::ok(),
            )])),
            statuses: Mutex::new(HashMap::from([(
                BUNDLE_PLUGIN.to_string(),
                PluginStatus::ok(),
            )])),
            hooks: Mutex::new(Vec::new()),
            state: Arc::new(MockState::default()),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            prepares: AtomicUsize::new(0),
            prepare_delay: Mutex::new(None),
            logs: Mutex::new(Vec::new()),
            fail_decision_log: Mutex::new(false),
        });
        engine.set_decision(json!(true));
        engine
    }

    pub fn set_decision(&self, decision: JsonValue) {
        *self.state.decision.lock().unwrap() = decision;
    }

    pub fn set_eval_error(&self, err: Option<EngineError>) {
        *self.state.eval_error.lock().unwrap() = err;
    }

    pub fn set_prepare_delay(&self, delay: Option<Duration>) {
        *self.prepare_delay.lock().unwrap() = delay;
    }

    pub fn set_plugin(&self, name: &str, plugin: Arc<MockPlugin>) {
        self.plugins.lock().unwrap().insert(name.to_string(), plugin);
        self.statuses
            .lock()
            .unwrap()
            .insert(name.to_string(), PluginStatus::ok());
    }

    pub fn remove_plugin(&self, name: &str) {
        self.plugins.lock().unwrap().remove(name);
        self.statuses.lock().unwrap().remove(name);
    }

    pub fn mock_plugin(&self, name: &str) -> Option<Arc<MockPlugin>> {
        self.plugins.lock().unwrap().get(name).cloned()
    }

    pub fn set_status(&self, name: &str, status: PluginStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(name.to_string(), status);
    }

    pub fn set_fail_decision_log(&self, fail: bool) {
        *self.fail_decision_log.lock().unwrap() = fail;
    }

    /// Simulate a bundle activation: every registered compiler-update hook
    /// fires.
    pub fn fire_compiler_update(&self) {
        for hook in self.hooks.lock().unwrap().iter() {
            hook();
        }
    }

    pub fn decision_logs(&self) -> Vec<DecisionLogEntry> {
        self.logs.lock().unwrap().clone()
    }

    pub fn eval_count(&self) -> usize {
        self.state.evals.load(Ordering::SeqCst)
    }

    pub fn prepare_count(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn start(&self) -> Result<(), EngineError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn plugin(&self, name: &str) -> Option<Arc<dyn EnginePlugin>> {
        self.plugins
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .map(|p| p as Arc<dyn EnginePlugin>)
    }

    fn plugin_status(&self) -> HashMap<String, PluginStatus> {
        self.statuses.lock().unwrap().clone()
    }

    fn on_compiler_update(&self, hook: Box<dyn Fn() + Send + Sync>) {
        self.hooks.lock().unwrap().push(hook);
    }

    async fn prepare_query(&self, _query: &str) -> Result<Arc<dyn PreparedQuery>, EngineError> {
        let delay = *self.prepare_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockQuery {
            state: Arc::clone(&self.state),
        }))
    }

    fn log_decision(&self, entry: DecisionLogEntry) -> Result<(), EngineError> {
        self.logs.lock().unwrap().push(entry);
        if *self.fail_decision_log.lock().unwrap() {
            return Err(EngineError::Internal("decision log sink is down".into()));
        }
        Ok(())
    }
}

struct MockQuery {
    state: Arc<MockState>,
}

#[async_trait]
impl PreparedQuery for MockQuery {
    async fn eval(
        &self,
        _input: &JsonValue,
        _opts: EvalOptions<'_>,
    ) -> Result<JsonValue, EngineError> {
        self.state.evals.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.state.eval_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.state.decision.lock().unwrap().clone())
    }
}

/// Factory handing out pre-registered engines (or fresh ready ones).
pub(crate) struct MockFactory {
    engines: Mutex<HashMap<String, Arc<MockEngine>>>,
    pub created: AtomicUsize,
    build_delay: Mutex<Option<Duration>>,
    build_error: Mutex<Option<EngineError>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            engines: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
            build_delay: Mutex::new(None),
            build_error: Mutex::new(None),
        })
    }

    pub fn register(&self, engine: Arc<MockEngine>) {
        self.engines
            .lock()
            .unwrap()
            .insert(engine.bundle.clone(), engine);
    }

    pub fn set_build_delay(&self, delay: Option<Duration>) {
        *self.build_delay.lock().unwrap() = delay;
    }

    pub fn set_build_error(&self, err: Option<EngineError>) {
        *self.build_error.lock().unwrap() = err;
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineFactory for MockFactory {
    async fn new_engine(&self, opts: EngineOptions) -> Result<Arc<dyn Engine>, EngineError> {
        let delay = *self.build_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.build_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let engine = {
            let mut engines = self.engines.lock().unwrap();
            engines
                .entry(opts.bundle.clone())
                .or_insert_with(|| MockEngine::ready(&opts.bundle))
                .clone()
        };
        Ok(engine as Arc<dyn Engine>)
    }
}
