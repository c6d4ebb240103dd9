//! Approval desk
//!
//! Holds action requests between parsing and dispatch. Approval is a human
//! decision taken here, never by the pipeline. Every transition is written
//! to the audit store before it becomes visible; a failed audit write leaves
//! the request where it was.

use super::dispatch::ActionApi;
use crate::audit::AuditStore;
use crate::error::OrchestrationError;
use crate::models::{ActionRequest, ActionState, ActionTransition};
use crate::session::SessionRegistry;
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SYSTEM_ACTOR: &str = "system";

/// How long settled requests stay queryable on the desk.
const SETTLED_RETENTION_HOURS: i64 = 24;

type RequestMap = HashMap<Uuid, ActionRequest>;

pub struct ActionDesk {
    requests: RwLock<RequestMap>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    api: Arc<dyn ActionApi>,
    audit: Arc<dyn AuditStore>,
    sessions: SessionRegistry,
}

/// Marks a request as being dispatched; released on drop, including when
/// the dispatching future is cancelled.
struct InFlight {
    set: Arc<Mutex<HashSet<Uuid>>>,
    request_id: Uuid,
}

impl InFlight {
    fn claim(set: &Arc<Mutex<HashSet<Uuid>>>, request_id: Uuid) -> Option<Self> {
        let mut claimed = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !claimed.insert(request_id) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            request_id,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut claimed = self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        claimed.remove(&self.request_id);
    }
}

impl ActionDesk {
    pub fn new(api: Arc<dyn ActionApi>, audit: Arc<dyn AuditStore>, sessions: SessionRegistry) -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            api,
            audit,
            sessions,
        }
    }

    /// Accept a freshly parsed `pending` request and audit its creation.
    pub async fn submit(&self, request: ActionRequest) -> Result<()> {
        if request.state != ActionState::Pending {
            return Err(OrchestrationError::InvalidTransition {
                from: request.state,
                to: ActionState::Pending,
            });
        }

        for transition in &request.history {
            self.audit.record_transition(transition).await?;
        }

        info!(
            request_id = %request.request_id,
            verb = %request.verb,
            requester = %request.requester,
            "Action request awaiting approval"
        );
        let mut requests = self.requests.write().await;
        evict_settled(&mut requests, Utc::now() - Duration::hours(SETTLED_RETENTION_HOURS));
        requests.insert(request.request_id, request);
        Ok(())
    }

    pub async fn get(&self, request_id: Uuid) -> Option<ActionRequest> {
        self.requests.read().await.get(&request_id).cloned()
    }

    /// Pending requests that can still be approved, oldest first.
    pub async fn pending(&self) -> Vec<ActionRequest> {
        let requests = self.requests.read().await;
        let mut pending: Vec<ActionRequest> = requests
            .values()
            .filter(|r| r.state == ActionState::Pending)
            .filter(|r| self.sessions.is_current(r.session_id, r.query_id))
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    /// Drop requests that reached a terminal state before `cutoff`.
    pub async fn evict_settled_before(&self, cutoff: DateTime<Utc>) -> usize {
        evict_settled(&mut *self.requests.write().await, cutoff)
    }

    pub async fn approve(&self, request_id: Uuid, actor: &str) -> Result<ActionRequest> {
        let mut requests = self.requests.write().await;
        let mut next = self.current_request(&mut requests, request_id).await?;

        let transition = next.approve(actor)?;
        let approved = self.commit(&mut requests, next, &transition).await?;
        info!(request_id = %request_id, actor, "Action approved");
        Ok(approved)
    }

    pub async fn reject(
        &self,
        request_id: Uuid,
        actor: &str,
        reason: Option<String>,
    ) -> Result<ActionRequest> {
        let mut requests = self.requests.write().await;
        let mut next = self.current_request(&mut requests, request_id).await?;

        let transition = next.reject(actor, reason)?;
        let rejected = self.commit(&mut requests, next, &transition).await?;
        info!(request_id = %request_id, actor, "Action rejected");
        Ok(rejected)
    }

    /// Send an approved request to the action API.
    ///
    /// An API failure moves the request to `failed` and is returned as a
    /// normal result; only lifecycle violations are errors.
    pub async fn dispatch(&self, request_id: Uuid, actor: &str) -> Result<ActionRequest> {
        let (snapshot, _claim) = {
            let requests = self.requests.read().await;
            let request = requests
                .get(&request_id)
                .ok_or(OrchestrationError::ActionNotFound(request_id))?;

            if !request.state.can_transition_to(ActionState::Dispatched) {
                return Err(OrchestrationError::InvalidTransition {
                    from: request.state,
                    to: ActionState::Dispatched,
                });
            }
            if !self.sessions.is_current(request.session_id, request.query_id) {
                warn!(request_id = %request_id, "Refusing dispatch of superseded request");
                return Err(OrchestrationError::ActionSuperseded(request_id));
            }

            // Claimed under the read lock: settling needs the write lock, so
            // no other caller can observe `approved` after this one settles.
            let claim = InFlight::claim(&self.in_flight, request_id).ok_or_else(|| {
                OrchestrationError::DispatchFailed(format!(
                    "dispatch of {} already in progress",
                    request_id
                ))
            })?;
            (request.clone(), claim)
        };

        let outcome = self.api.dispatch(&snapshot).await;
        self.settle(request_id, actor, outcome).await
    }

    pub async fn approve_and_dispatch(&self, request_id: Uuid, actor: &str) -> Result<ActionRequest> {
        self.approve(request_id, actor).await?;
        self.dispatch(request_id, actor).await
    }

    async fn settle(
        &self,
        request_id: Uuid,
        actor: &str,
        outcome: Result<super::DispatchReceipt>,
    ) -> Result<ActionRequest> {
        let mut requests = self.requests.write().await;
        let mut next = requests
            .get(&request_id)
            .cloned()
            .ok_or(OrchestrationError::ActionNotFound(request_id))?;

        let transition = match outcome {
            Ok(receipt) => next.mark_dispatched(actor, Some(receipt.message))?,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Action dispatch failed");
                next.mark_failed(actor, e.to_string())?
            }
        };
        self.commit(&mut requests, next, &transition).await
    }

    /// Copy of a request the caller may act on. A pending request whose
    /// session has moved on is closed by the system instead.
    async fn current_request(&self, requests: &mut RequestMap, request_id: Uuid) -> Result<ActionRequest> {
        let request = requests
            .get(&request_id)
            .cloned()
            .ok_or(OrchestrationError::ActionNotFound(request_id))?;

        if self.sessions.is_current(request.session_id, request.query_id) {
            return Ok(request);
        }

        if request.state == ActionState::Pending {
            let mut retired = request;
            let transition: ActionTransition = retired.reject(
                SYSTEM_ACTOR,
                Some("superseded by a newer query in the same session".to_string()),
            )?;
            self.commit(requests, retired, &transition).await?;
            info!(request_id = %request_id, "Superseded action request retired");
        }
        Err(OrchestrationError::ActionSuperseded(request_id))
    }

    /// Audit first, then publish the new state.
    async fn commit(
        &self,
        requests: &mut RequestMap,
        next: ActionRequest,
        transition: &ActionTransition,
    ) -> Result<ActionRequest> {
        self.audit.record_transition(transition).await?;
        requests.insert(next.request_id, next.clone());
        Ok(next)
    }
}

fn evict_settled(requests: &mut RequestMap, cutoff: DateTime<Utc>) -> usize {
    let before = requests.len();
    requests.retain(|_, r| {
        let settled_at = r.history.last().map(|t| t.at).unwrap_or(r.created_at);
        !(r.state.is_terminal() && settled_at < cutoff)
    });
    let evicted = before - requests.len();
    if evicted > 0 {
        debug!(evicted, "Evicted settled action requests");
    }
    evicted
}
