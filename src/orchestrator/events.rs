//! State/Event Publisher
//!
//! Subscribers first get the full service list and every service's health,
//! then only changes. Change detection
//! rides on the orchestrator's `watch` channel, so a slow subscriber simply
//! misses intermediate states and sees the latest one when it next polls.
//! Log lines travel separately through [`LogBuffer::subscribe`](super::log_buffer::LogBuffer::subscribe).

use super::health::HealthReport;
use super::protocol::{HealthCheckResult, ServiceInfo};
use super::services::Orchestrator;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

/// Message pushed to dashboard clients. Serialized with a `type` tag.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StateEvent {
    /// Initial state, or at least one status transition; carries the full current list
    Services { services: Vec<ServiceInfo> },
    /// Health for the services whose health changed (all of them initially)
    Health {
        services: Vec<HealthCheckResult>,
        summary: HealthReport,
    },
}

#[derive(Clone)]
pub struct StatePublisher {
    orchestrator: Arc<Orchestrator>,
}

impl StatePublisher {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn subscribe(&self) -> Subscription {
        let changes = self.orchestrator.subscribe_changes();
        Subscription {
            orchestrator: Arc::clone(&self.orchestrator),
            changes,
            last: None,
            pending: VecDeque::new(),
        }
    }
}

/// One subscriber's cursor over state changes.
pub struct Subscription {
    orchestrator: Arc<Orchestrator>,
    changes: watch::Receiver<u64>,
    last: Option<Vec<ServiceInfo>>,
    pending: VecDeque<StateEvent>,
}

impl Subscription {
    /// Next event. The first two calls yield the full `services` list and then
    /// `health` for every service. Returns `None` once the orchestrator is gone.
    pub async fn next(&mut self) -> Option<StateEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            let Some(last) = self.last.as_ref() else {
                let services = self.orchestrator.snapshot();
                self.pending.extend(initial(&services));
                self.last = Some(services);
                continue;
            };

            let current = self.orchestrator.snapshot();
            let events = diff(last, &current);
            self.last = Some(current);
            if !events.is_empty() {
                self.pending.extend(events);
                continue;
            }

            self.changes.changed().await.ok()?;
        }
    }
}

fn initial(services: &[ServiceInfo]) -> [StateEvent; 2] {
    [
        StateEvent::Services {
            services: services.to_vec(),
        },
        StateEvent::Health {
            services: services.iter().map(health_of).collect(),
            summary: HealthReport::from_services(services),
        },
    ]
}

fn health_of(svc: &ServiceInfo) -> HealthCheckResult {
    let mut result = svc.health_check.clone();
    result.status = svc.health;
    result
}

/// Events describing the move from `prev` to `next`.
pub fn diff(prev: &[ServiceInfo], next: &[ServiceInfo]) -> Vec<StateEvent> {
    let mut events = Vec::new();

    let status_changed = prev.len() != next.len()
        || prev
            .iter()
            .zip(next)
            .any(|(a, b)| a.name != b.name || !a.same_status(b));
    if status_changed {
        events.push(StateEvent::Services {
            services: next.to_vec(),
        });
    }

    let health_changed: Vec<HealthCheckResult> = next
        .iter()
        .filter(|svc| {
            prev.iter()
                .find(|p| p.name == svc.name)
                .map_or(true, |p| p.health != svc.health)
        })
        .map(health_of)
        .collect();
    if !health_changed.is_empty() {
        events.push(StateEvent::Health {
            services: health_changed,
            summary: HealthReport::from_services(next),
        });
    }

    events
}
