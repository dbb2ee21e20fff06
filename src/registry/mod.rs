//! Registry of connected Blender instances and their launch tasks.
//!
//! Mutations never suspend, so a registration or kill is observed either
//! completely or not at all by concurrent readers. Network work (probing,
//! sending) always runs on a snapshot taken outside the lock.

pub mod state;

use futures_util::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::instance::BlenderInstance;
use crate::task::TaskHandle;

pub use state::{Registration, RegistrationState};

/// Outcome of a broadcast to the responsive subset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastSummary {
    /// Instances that answered the probe in time
    pub responsive: usize,
    /// Of those, how many accepted the payload
    pub delivered: usize,
}

#[derive(Default)]
pub struct InstanceRegistry {
    instances: RwLock<Vec<Arc<BlenderInstance>>>,
    tasks: RwLock<Vec<Arc<dyn TaskHandle>>>,
    /// Lock order: `registrations` before `instances`.
    registrations: Mutex<HashMap<String, Registration>>,
}

fn apply(registration: &mut Registration, to: RegistrationState) {
    if let Err(e) = registration.transition(to) {
        tracing::warn!("Session {}: {}", registration.session_id, e);
    }
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any entry with the same session id, then appends.
    pub fn register_instance(&self, instance: Arc<BlenderInstance>) {
        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        let before = instances.len();
        instances.retain(|i| i.session_id() != instance.session_id());
        if instances.len() != before {
            tracing::info!("Replacing registered instance {}", instance.session_id());
        }
        tracing::info!(
            "Registered instance {} at {}",
            instance.session_id(),
            instance.address()
        );
        instances.push(instance);
    }

    /// Tasks are not deduplicated; lookups return the first match.
    pub fn register_task(&self, task: Arc<dyn TaskHandle>) {
        tracing::debug!("Registered task {}", task.identifier());
        self.tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    pub fn get_instance(&self, id: &str) -> Option<Arc<BlenderInstance>> {
        self.instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|i| i.session_id() == id)
            .cloned()
    }

    pub fn get_task(&self, id: &str) -> Option<Arc<dyn TaskHandle>> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|t| t.identifier() == id)
            .cloned()
    }

    /// Terminate the task for `id` (if any) and forget everything about it.
    /// Unknown identifiers are a no-op.
    pub fn kill(&self, id: &str) {
        if let Some(task) = self.get_task(id) {
            task.terminate();
        }

        let removed_tasks = {
            let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
            let before = tasks.len();
            tasks.retain(|t| t.identifier() != id);
            before - tasks.len()
        };
        let removed_instances = {
            let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
            let before = instances.len();
            instances.retain(|i| i.session_id() != id);
            before - instances.len()
        };

        if removed_instances > 0 {
            self.mark_removed(&[id.to_string()]);
        }

        if removed_tasks + removed_instances > 0 {
            tracing::info!(
                "Killed session {} ({} task(s), {} instance(s) removed)",
                id,
                removed_tasks,
                removed_instances
            );
        }
    }

    /// Keep only the instances for which `keep` returns true. Tasks are untouched.
    pub fn clear_instances<F>(&self, keep: F)
    where
        F: Fn(&BlenderInstance) -> bool,
    {
        let removed: Vec<String> = {
            let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
            let (kept, removed): (Vec<_>, Vec<_>) =
                instances.drain(..).partition(|i| keep(i.as_ref()));
            *instances = kept;
            removed.iter().map(|i| i.session_id().to_string()).collect()
        };
        self.mark_removed(&removed);
    }

    /// A validated `setup` for `id` arrived; its attach is about to start.
    ///
    /// A registered session is superseded (`Removed`, then `PendingAttach`);
    /// its instance stays reachable until the new one replaces it.
    pub fn begin_setup(&self, id: &str) {
        let mut registrations = self.registrations.lock().unwrap_or_else(|e| e.into_inner());
        let registration = registrations
            .entry(id.to_string())
            .or_insert_with(|| Registration::new(id));

        match registration.state {
            RegistrationState::Rejected => *registration = Registration::new(id),
            RegistrationState::Registered => apply(registration, RegistrationState::Removed),
            _ => {}
        }
        if registration.state != RegistrationState::PendingAttach {
            apply(registration, RegistrationState::PendingAttach);
        }
        registration.in_flight += 1;
    }

    /// The debugger attached: register `instance`, replacing any entry with
    /// the same identifier. The attach that resolves last owns the slot.
    pub fn attach_succeeded(&self, instance: Arc<BlenderInstance>) {
        let id = instance.session_id().to_string();
        let mut registrations = self.registrations.lock().unwrap_or_else(|e| e.into_inner());
        self.register_instance(instance);
        self.settle(&mut registrations, &id);
    }

    /// The debugger could not attach; nothing is registered.
    pub fn attach_failed(&self, id: &str) {
        let mut registrations = self.registrations.lock().unwrap_or_else(|e| e.into_inner());
        self.settle(&mut registrations, id);
    }

    fn settle(&self, registrations: &mut HashMap<String, Registration>, id: &str) {
        let Some(registration) = registrations.get_mut(id) else {
            return;
        };
        registration.in_flight = registration.in_flight.saturating_sub(1);
        if registration.in_flight > 0 {
            return;
        }
        let outcome = if self.get_instance(id).is_some() {
            RegistrationState::Registered
        } else {
            RegistrationState::Rejected
        };
        apply(registration, outcome);
    }

    fn mark_removed(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let mut registrations = self.registrations.lock().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            if let Some(registration) = registrations.get_mut(id) {
                // an attach still in flight registers its instance when it lands
                if registration.state == RegistrationState::Registered {
                    apply(registration, RegistrationState::Removed);
                }
            }
        }
    }

    /// Where the last setup for `id` stands; `Unregistered` if none was seen.
    pub fn registration_state(&self, id: &str) -> RegistrationState {
        self.registrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|r| r.state)
            .unwrap_or(RegistrationState::Unregistered)
    }

    /// Every registered instance, without probing.
    ///
    /// Alive means launched and registered. An instance paused at a
    /// breakpoint is alive but not responsive.
    pub fn get_alive(&self) -> Vec<Arc<BlenderInstance>> {
        self.instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn task_identifiers(&self) -> Vec<String> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|t| t.identifier().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Instances that answer a ping within `timeout`, probed concurrently.
    pub async fn get_responsive(&self, timeout: Duration) -> Vec<Arc<BlenderInstance>> {
        let instances = self.get_alive();
        if instances.is_empty() {
            return instances;
        }

        let probes = instances.iter().map(|i| i.is_responsive(timeout));
        let answers = join_all(probes).await;

        let responsive: Vec<_> = instances
            .into_iter()
            .zip(answers)
            .filter_map(|(instance, ok)| ok.then_some(instance))
            .collect();
        tracing::debug!("{} responsive instance(s)", responsive.len());
        responsive
    }

    /// Probe, then POST `payload` to every responsive instance concurrently.
    ///
    /// A failed send is recorded on its instance and does not affect the others.
    pub async fn send_to_responsive(&self, payload: &Value, timeout: Duration) -> BroadcastSummary {
        let responsive = self.get_responsive(timeout).await;
        if responsive.is_empty() {
            return BroadcastSummary::default();
        }

        let sends = responsive.iter().map(|instance| async move {
            match instance.post(payload).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Send to {} failed: {}", instance.session_id(), e);
                    instance.record_error(&e);
                    false
                }
            }
        });
        let results = join_all(sends).await;

        BroadcastSummary {
            responsive: responsive.len(),
            delivered: results.into_iter().filter(|ok| *ok).count(),
        }
    }

    /// Fire-and-forget POST to every registered instance; returns immediately.
    pub fn send_to_all(&self, payload: Value) {
        let payload = Arc::new(payload);
        for instance in self.get_alive() {
            let payload = payload.clone();
            tokio::spawn(async move {
                if let Err(e) = instance.post(&payload).await {
                    tracing::warn!("Send to {} failed: {}", instance.session_id(), e);
                    instance.record_error(&e);
                }
            });
        }
    }

    /// Probe, then GET with `payload` from every responsive instance.
    ///
    /// Returns the successful answers in registration order.
    pub async fn get_from_responsive(&self, payload: &Value, timeout: Duration) -> Vec<Value> {
        let responsive = self.get_responsive(timeout).await;

        let requests = responsive.iter().map(|instance| async move {
            match instance.get(payload).await {
                Ok(answer) => Some(answer),
                Err(e) => {
                    tracing::warn!("Request to {} failed: {}", instance.session_id(), e);
                    instance.record_error(&e);
                    None
                }
            }
        });
        join_all(requests).await.into_iter().flatten().collect()
    }
}
