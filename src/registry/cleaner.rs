//! Background reclamation of idle instances.

use std::sync::Arc;

use log::{debug, info};
use tokio::time::MissedTickBehavior;

use crate::instance::DEFAULT_SHUTDOWN_GRACE_PERIOD;

use super::Registry;

/// Periodically close instances that have been unreferenced longer than the
/// reuse duration. Runs until the registry's quit signal fires. Instances
/// are unlinked under the registry lock and closed outside of it, so a
/// route-referenced instance can never be reclaimed.
pub(crate) async fn run(registry: Arc<Registry>) {
    let period = registry.config().clean_interval;
    let reuse = registry.config().reuse_duration;
    let quit = registry.quit_token();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = quit.cancelled() => break,
            _ = ticker.tick() => {
                for (bundle, instance) in registry.take_expired(reuse) {
                    info!("closing idle instance for bundle '{bundle}'");
                    instance.close(DEFAULT_SHUTDOWN_GRACE_PERIOD).await;
                }
            }
        }
    }
    debug!("instance cleaner stopped");
}

#[cfg(test)]
mod tests {
    use crate::engine::testing::{MockEngine, MockFactory};
    use crate::instance::InstanceState;
    use crate::registry::tests::{new_registry, test_config};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn idle_instances_are_reclaimed_after_the_reuse_window() {
        let factory = MockFactory::new();
        let engine = MockEngine::ready("idle");
        factory.register(Arc::clone(&engine));
        let mut config = test_config();
        config.reuse_duration = Duration::from_secs(5);
        config.clean_interval = Duration::from_secs(1);
        let registry = new_registry(config, &factory);

        let instance = registry.get_or_start("idle").await.unwrap();
        registry.mark_unused(&HashSet::new());
        assert_eq!(registry.len(), 1);

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert!(registry.is_empty());
        assert_eq!(instance.state(), InstanceState::Closed);
        assert_eq!(engine.stops.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn referenced_instances_are_never_reclaimed() {
        let factory = MockFactory::new();
        factory.register(MockEngine::ready("pinned"));
        factory.register(MockEngine::ready("stale"));
        let mut config = test_config();
        config.reuse_duration = Duration::from_secs(5);
        config.clean_interval = Duration::from_secs(1);
        let registry = new_registry(config, &factory);

        let pinned = registry.get_or_start("pinned").await.unwrap();
        registry.get_or_start("stale").await.unwrap();
        registry.mark_unused(&HashSet::from(["pinned".to_string()]));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(registry.len(), 1);
        assert_eq!(pinned.state(), InstanceState::Ready);
        assert_eq!(
            registry.snapshot_instances()[0].bundle(),
            "pinned"
        );
    }
}
