//! Background removal of idle session containers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::registry::ContainerRegistry;

/// Destroys containers whose session has been idle longer than a threshold.
pub struct IdleReaper {
    registry: Arc<ContainerRegistry>,
    idle_timeout: Duration,
}

impl IdleReaper {
    pub fn new(registry: Arc<ContainerRegistry>, idle_timeout: Duration) -> Self {
        Self {
            registry,
            idle_timeout,
        }
    }

    /// Reaper using the registry's configured idle timeout.
    pub fn from_registry(registry: Arc<ContainerRegistry>) -> Self {
        let idle_timeout = registry.settings().idle_timeout();
        Self::new(registry, idle_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// One sweep. Returns how many containers were destroyed.
    ///
    /// Sessions with a command in flight are never idle. A failure on one
    /// entry is logged and the sweep moves on.
    pub async fn cleanup_expired(&self) -> usize {
        let mut reaped = 0;
        for session_id in self.registry.sessions() {
            match self
                .registry
                .destroy_if_idle(&session_id, self.idle_timeout)
                .await
            {
                Ok(true) => reaped += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to reap idle sandbox")
                }
            }
        }

        if reaped > 0 {
            tracing::info!(reaped = reaped, remaining = self.registry.len(), "Reaped idle sandboxes");
            metrics::counter!("sandbox_reaped_total").increment(reaped as u64);
        }
        reaped
    }

    /// Run [`IdleReaper::cleanup_expired`] every `period` on a background task.
    pub fn spawn(self: Arc<Self>, period: Duration) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tracing::debug!("Starting idle sandbox sweep");
                        self.cleanup_expired().await;
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            tracing::debug!("Idle reaper stopped");
        });

        ReaperHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running reaper task.
pub struct ReaperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the task, waiting for an in-progress sweep to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandExecutor;
    use crate::mock::{MockRuntime, RuntimeCall};
    use agent_sandbox_core::config::SandboxSettings;
    use agent_sandbox_core::types::{ExecRequest, SessionId};

    fn setup() -> (Arc<MockRuntime>, Arc<ContainerRegistry>) {
        let runtime = Arc::new(MockRuntime::new());
        let registry = Arc::new(ContainerRegistry::new(
            runtime.clone(),
            SandboxSettings::default(),
        ));
        (runtime, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_idle_entries_are_reaped() {
        let (runtime, registry) = setup();
        let reaper = IdleReaper::new(registry.clone(), Duration::from_secs(60));
        let executor = CommandExecutor::new(registry.clone());

        let idle = registry.get_or_create(&"idle".into()).await.unwrap();
        let active = registry.get_or_create(&"active".into()).await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        executor
            .exec_command(&ExecRequest::new("active", "true"))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(reaper.cleanup_expired().await, 1);
        assert!(!registry.contains(&SessionId::from("idle")));
        assert!(registry.contains(&SessionId::from("active")));

        // The expired container is stopped then removed on the runtime
        let calls = runtime.calls_for(&idle.id);
        assert_eq!(
            &calls[calls.len() - 2..],
            &[
                RuntimeCall::StopContainer(idle.id.clone()),
                RuntimeCall::RemoveContainer(idle.id.clone()),
            ]
        );
        assert!(!runtime.calls_for(&active.id).iter().any(|c| matches!(
            c,
            RuntimeCall::StopContainer(_) | RuntimeCall::RemoveContainer(_)
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_creation_is_reaped() {
        let runtime = Arc::new(MockRuntime::new().with_start_delay(Duration::from_secs(60)));
        let registry = Arc::new(ContainerRegistry::new(
            runtime.clone(),
            SandboxSettings::default(),
        ));
        let reaper = IdleReaper::new(registry.clone(), Duration::from_secs(1800));
        let session = SessionId::from("s1");

        let abandoned =
            tokio::time::timeout(Duration::from_secs(1), registry.get_or_create(&session)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
        assert_eq!(reaper.cleanup_expired().await, 1);
        assert!(registry.is_empty());
        assert_eq!(runtime.create_count(), 1);
        assert!(runtime
            .calls()
            .iter()
            .any(|c| matches!(c, RuntimeCall::RemoveContainer(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recreated_after_reap() {
        let (runtime, registry) = setup();
        let reaper = IdleReaper::new(registry.clone(), Duration::from_secs(10));
        let session = SessionId::from("s1");

        let first = registry.get_or_create(&session).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(reaper.cleanup_expired().await, 1);

        let second = registry.get_or_create(&session).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(runtime.create_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_teardown_is_logged_and_skipped() {
        let (runtime, registry) = setup();
        let reaper = IdleReaper::new(registry.clone(), Duration::from_secs(10));
        registry.get_or_create(&"a".into()).await.unwrap();
        registry.get_or_create(&"b".into()).await.unwrap();

        runtime.set_fail_remove(true);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(reaper.cleanup_expired().await, 0);
        assert_eq!(registry.len(), 2);

        runtime.set_fail_remove(false);
        assert_eq!(reaper.cleanup_expired().await, 2);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_reaper_sweeps_periodically() {
        let (_runtime, registry) = setup();
        let reaper = Arc::new(IdleReaper::new(registry.clone(), Duration::from_secs(30)));
        registry.get_or_create(&"s1".into()).await.unwrap();

        let handle = reaper.spawn(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(registry.contains(&SessionId::from("s1")));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(registry.is_empty());

        handle.shutdown().await;
    }
}
