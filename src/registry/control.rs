//! Custom control loop: periodic, jittered bundle polling.
//!
//! When the host opts into custom control, the engine's built-in triggers
//! are switched to manual mode and this loop becomes the only source of
//! bundle refreshes. The jitter spreads the polls of many proxy instances
//! sharing one control plane.

use std::{sync::Arc, time::Duration};

use log::{debug, warn};
use rand::Rng;

use super::Registry;

pub(crate) async fn run(registry: Arc<Registry>) {
    let base = registry.config().control_loop_interval;
    let max_jitter = registry.config().control_loop_max_jitter;
    let trigger_timeout = registry.config().instance_startup_timeout;
    let quit = registry.quit_token();
    loop {
        let wait = jittered_interval(base, max_jitter);
        tokio::select! {
            _ = quit.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        // Snapshot under the lock, trigger outside of it.
        for instance in registry.snapshot_instances() {
            match tokio::time::timeout(trigger_timeout, instance.trigger_plugins()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    "periodic trigger for bundle '{}' failed: {e}",
                    instance.bundle()
                ),
                Err(_) => warn!(
                    "periodic trigger for bundle '{}' exceeded {trigger_timeout:?}",
                    instance.bundle()
                ),
            }
        }
    }
    debug!("control loop stopped");
}

/// The next control-loop interval: `base` plus a uniform offset in
/// `[-max_jitter/2, +max_jitter/2]`. A non-positive jitter yields fixed
/// intervals.
pub(crate) fn jittered_interval(base: Duration, max_jitter: Duration) -> Duration {
    if max_jitter.is_zero() {
        return base;
    }
    let half = max_jitter.as_secs_f64() / 2.0;
    let offset = rand::thread_rng().gen_range(-half..=half);
    Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{MockEngine, MockFactory};
    use crate::engine::BUNDLE_PLUGIN;
    use crate::registry::tests::{new_registry, test_config};
    use proptest::prelude::*;

    #[tokio::test(start_paused = true)]
    async fn loop_triggers_every_instance_each_round() {
        let factory = MockFactory::new();
        let engine = MockEngine::ready("play");
        factory.register(Arc::clone(&engine));
        let mut config = test_config();
        config.enable_custom_control_loop = true;
        config.control_loop_interval = Duration::from_secs(60);
        config.control_loop_max_jitter = Duration::ZERO;
        let registry = new_registry(config, &factory);

        registry.get_or_start("play").await.unwrap();
        let bundle = engine.mock_plugin(BUNDLE_PLUGIN).unwrap();
        let after_start = bundle.trigger_count();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(bundle.trigger_count(), after_start + 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(bundle.trigger_count(), after_start + 2);

        registry.close().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(bundle.trigger_count(), after_start + 2);
    }

    #[test]
    fn zero_jitter_is_a_fixed_interval() {
        let base = Duration::from_secs(60);
        assert_eq!(jittered_interval(base, Duration::ZERO), base);
    }

    proptest! {
        /// Successive intervals stay within [T - J/2, T + J/2].
        #[test]
        fn jitter_stays_within_half_spread(
            base_ms in 1u64..600_000,
            jitter_ms in 0u64..60_000,
        ) {
            let base = Duration::from_millis(base_ms);
            let jitter = Duration::from_millis(jitter_ms);
            for _ in 0..32 {
                let interval = jittered_interval(base, jitter).as_secs_f64();
                let lo = (base.as_secs_f64() - jitter.as_secs_f64() / 2.0).max(0.0);
                let hi = base.as_secs_f64() + jitter.as_secs_f64() / 2.0;
                prop_assert!(interval >= lo - 1e-9, "{interval} < {lo}");
                prop_assert!(interval <= hi + 1e-9, "{interval} > {hi}");
            }
        }
    }
}
