//! Process-wide registry of policy-engine instances.
//!
//! The registry owns every instance, keyed by bundle name. Creation is
//! deduplicated per name (single flight), idle instances are tracked for
//! the cleaner, and two background workers (cleaner, control loop) live for
//! the registry's lifetime.

mod cleaner;
mod control;

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use log::{debug, info, warn};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    body::BodyBudget,
    config::OpaConfig,
    engine::EngineFactory,
    error::{OpaError, OpaResult},
    instance::{Instance, DEFAULT_SHUTDOWN_GRACE_PERIOD},
    routing::{PostProcessor, PreProcessor},
};

type StartResult = Option<Result<Arc<Instance>, OpaError>>;

struct Inner {
    instances: HashMap<String, Arc<Instance>>,
    /// Stamped only for instances currently unreferenced by any route.
    last_used: HashMap<String, Instant>,
    /// In-flight starts; waiters share the starter's result.
    starting: HashMap<String, watch::Receiver<StartResult>>,
    closed: bool,
}

/// Owner of all instances built from one configuration.
pub struct Registry {
    inner: Mutex<Inner>,
    quit: CancellationToken,
    body_budget: Arc<BodyBudget>,
    config: OpaConfig,
    template: String,
    factory: Arc<dyn EngineFactory>,
}

impl Registry {
    /// Validate the configuration, resolve the engine template and spawn
    /// the background workers. Must be called within a tokio runtime.
    pub fn new(config: OpaConfig, factory: Arc<dyn EngineFactory>) -> OpaResult<Arc<Self>> {
        let config = config.validated()?;
        let template = config.template_text()?;
        let registry = Arc::new(Self {
            inner: Mutex::new(Inner {
                instances: HashMap::new(),
                last_used: HashMap::new(),
                starting: HashMap::new(),
                closed: false,
            }),
            quit: CancellationToken::new(),
            body_budget: BodyBudget::new(config.max_memory_body_parsing),
            config,
            template,
            factory,
        });

        tokio::spawn(cleaner::run(Arc::clone(&registry)));
        if registry.config.enable_custom_control_loop {
            tokio::spawn(control::run(Arc::clone(&registry)));
        }
        Ok(registry)
    }

    pub fn config(&self) -> &OpaConfig {
        &self.config
    }

    pub fn body_budget(&self) -> &Arc<BodyBudget> {
        &self.body_budget
    }

    pub(crate) fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }

    /// The route pre-processor bound to this registry.
    pub fn new_pre_processor(self: &Arc<Self>) -> PreProcessor {
        PreProcessor::new(Arc::clone(self))
    }

    /// The route post-processor bound to this registry.
    pub fn new_post_processor(self: &Arc<Self>) -> PostProcessor {
        PostProcessor::new(Arc::clone(self))
    }

    /// Return the instance for `bundle`, creating and starting it when
    /// absent. At most one start per bundle name runs at any time;
    /// concurrent callers observe the single start's result. A failed start
    /// forgets the name so a later call retries fresh.
    pub async fn get_or_start(&self, bundle: &str) -> OpaResult<Arc<Instance>> {
        enum Action {
            Wait(watch::Receiver<StartResult>),
            Start(watch::Sender<StartResult>),
        }

        let action = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(OpaError::RegistryClosed);
            }
            if let Some(instance) = inner.instances.get(bundle).cloned() {
                // Referenced again: no longer idle.
                inner.last_used.remove(bundle);
                return Ok(instance);
            }
            match inner.starting.get(bundle) {
                Some(rx) => Action::Wait(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inner.starting.insert(bundle.to_string(), rx);
                    Action::Start(tx)
                }
            }
        };

        match action {
            Action::Wait(mut rx) => match rx.wait_for(Option::is_some).await {
                Ok(result) => result.clone().expect("guarded by wait_for"),
                // The starter vanished without a result; only a closing
                // registry drops senders mid-flight.
                Err(_) => Err(OpaError::RegistryClosed),
            },
            Action::Start(tx) => {
                let started = self.start_instance(bundle).await;

                let mut doomed = None;
                let result = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.starting.remove(bundle);
                    match started {
                        Ok(instance) if inner.closed => {
                            doomed = Some(instance);
                            Err(OpaError::RegistryClosed)
                        }
                        Ok(instance) => {
                            inner
                                .instances
                                .insert(bundle.to_string(), Arc::clone(&instance));
                            Ok(instance)
                        }
                        Err(e) => Err(e),
                    }
                };
                if let Some(instance) = doomed {
                    instance.close(DEFAULT_SHUTDOWN_GRACE_PERIOD).await;
                }
                let _ = tx.send(Some(result.clone()));
                result
            }
        }
    }

    async fn start_instance(&self, bundle: &str) -> OpaResult<Arc<Instance>> {
        debug!("starting instance for bundle '{bundle}'");
        let instance =
            Instance::new(bundle, &self.template, &self.config, &self.factory).await?;
        let timeout = self.config.instance_startup_timeout;
        let started = if self.config.enable_custom_control_loop {
            instance.start_and_trigger(timeout).await
        } else {
            instance.start(timeout).await
        };
        match started {
            Ok(()) => Ok(instance),
            Err(e) => {
                warn!("instance startup for bundle '{bundle}' failed: {e}");
                Err(e)
            }
        }
    }

    /// Route post-processing: stamp every instance that no route in
    /// `in_use` references as idle-since-now, and clear the idle mark of
    /// every referenced one.
    pub fn mark_unused(&self, in_use: &HashSet<String>) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let bundles: Vec<String> = inner.instances.keys().cloned().collect();
        for bundle in bundles {
            if in_use.contains(&bundle) {
                inner.last_used.remove(&bundle);
            } else {
                inner.last_used.insert(bundle, now);
            }
        }
    }

    /// Remove and return every instance that has been idle longer than
    /// `reuse`. Instances without an idle stamp are in use and skipped.
    pub(crate) fn take_expired(&self, reuse: std::time::Duration) -> Vec<(String, Arc<Instance>)> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let expired: Vec<String> = inner
            .last_used
            .iter()
            .filter(|(_, stamp)| now.duration_since(**stamp) > reuse)
            .map(|(bundle, _)| bundle.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|bundle| {
                inner.last_used.remove(&bundle);
                inner
                    .instances
                    .remove(&bundle)
                    .map(|instance| (bundle, instance))
            })
            .collect()
    }

    /// All live instances, for the control loop's trigger round.
    pub(crate) fn snapshot_instances(&self) -> Vec<Arc<Instance>> {
        self.inner
            .lock()
            .unwrap()
            .instances
            .values()
            .cloned()
            .collect()
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Close the registry: stop the background workers and close every
    /// instance under the shutdown grace period. Idempotent; later
    /// [`Registry::get_or_start`] calls fail with
    /// [`OpaError::RegistryClosed`].
    pub async fn close(&self) {
        let doomed: Vec<Arc<Instance>> = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.starting.clear();
            inner.last_used.clear();
            inner.instances.drain().map(|(_, v)| v).collect()
        };
        self.quit.cancel();
        info!("closing registry with {} instance(s)", doomed.len());
        futures::future::join_all(
            doomed
                .iter()
                .map(|instance| instance.close(DEFAULT_SHUTDOWN_GRACE_PERIOD)),
        )
        .await;
    }
}
