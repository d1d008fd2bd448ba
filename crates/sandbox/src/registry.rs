//! Per-session container registry.
//!
//! Maps a session to at most one live container. Each session owns a slot
//! guarded by its own async `RwLock`:
//!
//! - executions hold the slot in read mode (see [`ContainerLease`]), so
//!   several commands may run in one container at once;
//! - creation and destruction hold it in write mode, so a destroy waits for
//!   in-flight executions and a lookup never hands out a container that is
//!   being torn down.
//!
//! The map itself is only locked for insert/remove, never across runtime I/O,
//! so sessions never wait on each other.

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::Instant;

use agent_sandbox_core::config::SandboxSettings;
use agent_sandbox_core::events::{EventEnvelope, EventType, SandboxLifecyclePayload};
use agent_sandbox_core::traits::EventEmitter;
use agent_sandbox_core::types::SessionId;
use agent_sandbox_core::{Error, Result};

use crate::runtime::{ContainerId, ContainerRuntime, ContainerSpec};

// =============================================================================
// Entry Types
// =============================================================================

/// Handle to a session's running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: ContainerId,
    pub session_id: SessionId,
    pub image: String,
}

/// Read-only view of a registry entry.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub session_id: SessionId,
    pub container_id: ContainerId,
    pub idle_for: Duration,
}

struct ContainerEntry {
    handle: ContainerHandle,
    last_used: Mutex<Instant>,
}

impl ContainerEntry {
    fn new(handle: ContainerHandle) -> Self {
        Self {
            handle,
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.lock() {
            *last_used = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|last_used| last_used.elapsed())
            .unwrap_or_default()
    }
}

enum SlotState {
    /// Slot reserved, container not created yet (or creation failed).
    Vacant,
    Live(ContainerEntry),
    /// Torn down and unlinked from the map; holders must look up a fresh slot.
    Retired,
}

enum Peek {
    Live(ContainerHandle),
    Vacant,
    Retired,
}

impl SlotState {
    fn peek_and_touch(&self) -> Peek {
        match self {
            SlotState::Live(entry) => {
                entry.touch();
                Peek::Live(entry.handle.clone())
            }
            SlotState::Vacant => Peek::Vacant,
            SlotState::Retired => Peek::Retired,
        }
    }
}

type Slot = Arc<RwLock<SlotState>>;

/// Shared hold on a session's container.
///
/// While a lease is alive the container cannot be destroyed. Dropping it
/// refreshes the entry's last-used time.
pub struct ContainerLease {
    guard: OwnedRwLockReadGuard<SlotState>,
    handle: ContainerHandle,
}

impl ContainerLease {
    pub fn handle(&self) -> &ContainerHandle {
        &self.handle
    }

    pub fn container_id(&self) -> &ContainerId {
        &self.handle.id
    }
}

impl Drop for ContainerLease {
    fn drop(&mut self) {
        if let SlotState::Live(entry) = &*self.guard {
            entry.touch();
        }
    }
}

// =============================================================================
// Container Registry
// =============================================================================

/// Owns every session container of the process.
pub struct ContainerRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    settings: SandboxSettings,
    slots: Arc<DashMap<SessionId, Slot>>,
    event_emitter: Option<Arc<dyn EventEmitter>>,
}

impl ContainerRegistry {
    /// Create a new registry on top of `runtime`.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: SandboxSettings) -> Self {
        Self {
            runtime,
            settings,
            slots: Arc::new(DashMap::new()),
            event_emitter: None,
        }
    }

    /// Set an event emitter for auditing container lifecycle.
    pub fn with_event_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.event_emitter = Some(emitter);
        self
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Get the session's container, creating and starting one on first use.
    pub async fn get_or_create(&self, session_id: &SessionId) -> Result<ContainerHandle> {
        let lease = self.lease(session_id).await?;
        Ok(lease.handle().clone())
    }

    /// Like [`ContainerRegistry::get_or_create`], but keeps the container
    /// pinned until the returned lease is dropped.
    ///
    /// Creation runs on its own task that owns the slot's write lock. If the
    /// caller is cancelled mid-creation the container is still registered,
    /// so a later destroy or idle sweep can find and remove it.
    pub async fn lease(&self, session_id: &SessionId) -> Result<ContainerLease> {
        loop {
            let slot = self.slot(session_id);

            // Fast path: container already running
            let guard = slot.clone().read_owned().await;
            match guard.peek_and_touch() {
                Peek::Live(handle) => return Ok(ContainerLease { guard, handle }),
                Peek::Retired => continue,
                Peek::Vacant => drop(guard),
            }

            // Slow path: create under the session's write lock
            let guard = slot.clone().write_owned().await;
            match guard.peek_and_touch() {
                Peek::Live(handle) => {
                    return Ok(ContainerLease {
                        guard: guard.downgrade(),
                        handle,
                    })
                }
                Peek::Retired => continue,
                Peek::Vacant => {}
            }

            let task = tokio::spawn(self.provisioner().fill(session_id.clone(), slot, guard));
            let (guard, handle) = task.await.map_err(|e| {
                Error::internal(format!("Container provisioning task failed: {}", e))
            })??;
            return Ok(ContainerLease {
                guard: guard.downgrade(),
                handle,
            });
        }
    }

    /// Stop and remove the session's container. Returns whether one existed.
    ///
    /// Waits for in-flight executions on the session. If the runtime fails,
    /// the entry stays registered so a later call can retry.
    pub async fn destroy(&self, session_id: &SessionId) -> Result<bool> {
        let Some(slot) = self.slots.get(session_id).map(|s| s.clone()) else {
            return Ok(false);
        };
        let mut guard = slot.clone().write_owned().await;
        self.teardown(session_id, &slot, &mut guard, "explicit").await
    }

    /// Destroy the session's container if it has been idle longer than `threshold`.
    ///
    /// Busy sessions (an execution or creation in flight) are skipped.
    pub async fn destroy_if_idle(&self, session_id: &SessionId, threshold: Duration) -> Result<bool> {
        let Some(slot) = self.slots.get(session_id).map(|s| s.clone()) else {
            return Ok(false);
        };
        let Ok(mut guard) = slot.clone().try_write_owned() else {
            tracing::trace!(session_id = %session_id, "Session busy, not idle");
            return Ok(false);
        };

        // Re-check under the lock; the entry may have been used since the scan
        match &*guard {
            SlotState::Live(entry) if entry.idle_for() > threshold => {}
            SlotState::Vacant => {
                // Reserved but never filled; nothing to stop
                retire(&self.slots, session_id, &slot, &mut guard);
                return Ok(false);
            }
            _ => return Ok(false),
        }
        self.teardown(session_id, &slot, &mut guard, "idle").await
    }

    /// Destroy every container, logging individual failures.
    pub async fn shutdown(&self) -> usize {
        let mut destroyed = 0;
        for session_id in self.sessions() {
            let Some(slot) = self.slots.get(&session_id).map(|s| s.clone()) else {
                continue;
            };
            let mut guard = slot.clone().write_owned().await;
            match self.teardown(&session_id, &slot, &mut guard, "shutdown").await {
                Ok(true) => destroyed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to destroy sandbox on shutdown")
                }
            }
        }
        destroyed
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.slots.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Snapshot of registered session IDs.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.slots.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of live entries. Sessions locked for creation or teardown are omitted.
    pub fn entries(&self) -> Vec<EntryInfo> {
        let slots: Vec<(SessionId, Slot)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        slots
            .into_iter()
            .filter_map(|(session_id, slot)| {
                let guard = slot.try_read().ok()?;
                let info = match &*guard {
                    SlotState::Live(entry) => Some(EntryInfo {
                        session_id,
                        container_id: entry.handle.id.clone(),
                        idle_for: entry.idle_for(),
                    }),
                    _ => None,
                };
                info
            })
            .collect()
    }

    fn slot(&self, session_id: &SessionId) -> Slot {
        self.slots
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(SlotState::Vacant)))
            .clone()
    }

    fn provisioner(&self) -> Provisioner {
        Provisioner {
            runtime: self.runtime.clone(),
            settings: self.settings.clone(),
            slots: self.slots.clone(),
            event_emitter: self.event_emitter.clone(),
        }
    }

    /// Stop (bounded grace), force-remove, then unlink. Caller holds the write lock.
    async fn teardown(
        &self,
        session_id: &SessionId,
        slot: &Slot,
        guard: &mut OwnedRwLockWriteGuard<SlotState>,
        reason: &str,
    ) -> Result<bool> {
        let id = match &**guard {
            SlotState::Live(entry) => Some(entry.handle.id.clone()),
            SlotState::Vacant => None,
            SlotState::Retired => return Ok(false),
        };
        let Some(id) = id else {
            retire(&self.slots, session_id, slot, guard);
            return Ok(false);
        };

        if let Err(e) = self
            .runtime
            .stop_container(&id, self.settings.stop_grace())
            .await
        {
            tracing::warn!(container_id = %id, error = %e, "Graceful stop failed, forcing removal");
        }
        self.runtime.remove_container(&id, true).await?;

        retire(&self.slots, session_id, slot, guard);

        tracing::info!(session_id = %session_id, container_id = %id, reason = reason, "Sandbox container destroyed");
        metrics::counter!("sandbox_containers_destroyed_total", "reason" => reason.to_string())
            .increment(1);

        emit_lifecycle(
            self.event_emitter.as_ref(),
            EventType::SandboxDestroyed,
            session_id,
            SandboxLifecyclePayload {
                container_id: id.0.clone(),
                image: None,
                reason: reason.to_string(),
            },
        )
        .await;

        Ok(true)
    }

}

// =============================================================================
// Provisioning
// =============================================================================

/// Owned copy of what container creation needs; runs on a spawned task.
struct Provisioner {
    runtime: Arc<dyn ContainerRuntime>,
    settings: SandboxSettings,
    slots: Arc<DashMap<SessionId, Slot>>,
    event_emitter: Option<Arc<dyn EventEmitter>>,
}

impl Provisioner {
    /// Create the container and store it in the locked slot. On failure the
    /// slot is retired so waiters move on to a fresh one.
    async fn fill(
        self,
        session_id: SessionId,
        slot: Slot,
        mut guard: OwnedRwLockWriteGuard<SlotState>,
    ) -> Result<(OwnedRwLockWriteGuard<SlotState>, ContainerHandle)> {
        match self.provision(&session_id).await {
            Ok(handle) => {
                *guard = SlotState::Live(ContainerEntry::new(handle.clone()));
                Ok((guard, handle))
            }
            Err(e) => {
                retire(&self.slots, &session_id, &slot, &mut guard);
                Err(e)
            }
        }
    }

    async fn provision(&self, session_id: &SessionId) -> Result<ContainerHandle> {
        let spec = ContainerSpec::for_session(&self.settings, session_id.as_str());
        let id = self.runtime.create_container(&spec).await?;

        if let Err(e) = self.runtime.start_container(&id).await {
            // Don't leak a created-but-dead container
            if let Err(cleanup) = self.runtime.remove_container(&id, true).await {
                tracing::warn!(container_id = %id, error = %cleanup, "Failed to remove unstarted container");
            }
            return Err(e);
        }

        tracing::info!(
            session_id = %session_id,
            container_id = %id,
            image = %spec.image,
            "Sandbox container created and started"
        );
        metrics::counter!("sandbox_containers_created_total").increment(1);

        emit_lifecycle(
            self.event_emitter.as_ref(),
            EventType::SandboxCreated,
            session_id,
            SandboxLifecyclePayload {
                container_id: id.0.clone(),
                image: Some(spec.image.clone()),
                reason: "created".to_string(),
            },
        )
        .await;

        Ok(ContainerHandle {
            id,
            session_id: session_id.clone(),
            image: spec.image,
        })
    }
}

/// Mark the slot dead and unlink it, unless a newer slot replaced it.
fn retire(
    slots: &DashMap<SessionId, Slot>,
    session_id: &SessionId,
    slot: &Slot,
    guard: &mut OwnedRwLockWriteGuard<SlotState>,
) {
    **guard = SlotState::Retired;
    slots.remove_if(session_id, |_, current| Arc::ptr_eq(current, slot));
}

async fn emit_lifecycle(
    emitter: Option<&Arc<dyn EventEmitter>>,
    event_type: EventType,
    session_id: &SessionId,
    payload: SandboxLifecyclePayload,
) {
    if let Some(emitter) = emitter {
        emitter
            .emit(
                EventEnvelope::new(event_type, serde_json::to_value(payload).unwrap_or_default())
                    .with_session(session_id.as_str())
                    .with_actor("container-registry"),
            )
            .await;
    }
}
