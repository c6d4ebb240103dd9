//! Session registry
//!
//! Tracks the newest query per session and the cancellation token of the
//! pipeline currently running for it. Starting a new query cancels the
//! previous one in the same session.

use crate::models::Query;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct SessionSlot {
    latest_query: Option<Uuid>,
    running: Option<(Uuid, CancellationToken)>,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    slots: Arc<Mutex<HashMap<Uuid, SessionSlot>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, SessionSlot>> {
        // a panic while holding the lock leaves the map itself consistent
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `query` as the session's newest and cancel whatever was
    /// running for that session.
    pub fn begin(&self, query: &Query) -> PipelineGuard {
        let token = CancellationToken::new();

        let mut slots = self.lock();
        let slot = slots.entry(query.session_id).or_default();

        if let Some((previous, running)) = slot.running.take() {
            debug!(
                session_id = %query.session_id,
                superseded = %previous,
                by = %query.query_id,
                "Cancelling superseded pipeline"
            );
            running.cancel();
        }

        slot.latest_query = Some(query.query_id);
        slot.running = Some((query.query_id, token.clone()));

        PipelineGuard {
            slots: Arc::clone(&self.slots),
            session_id: query.session_id,
            query_id: query.query_id,
            token,
        }
    }

    /// Whether `query_id` is still the newest query in its session.
    pub fn is_current(&self, session_id: Uuid, query_id: Uuid) -> bool {
        self.lock()
            .get(&session_id)
            .and_then(|slot| slot.latest_query)
            .map(|latest| latest == query_id)
            .unwrap_or(true)
    }

    /// Cancel the session's running pipeline, if any.
    pub fn cancel(&self, session_id: Uuid) -> bool {
        let mut slots = self.lock();
        match slots.get_mut(&session_id).and_then(|slot| slot.running.take()) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn running(&self) -> usize {
        self.lock().values().filter(|s| s.running.is_some()).count()
    }

    /// Cancel everything. Used on shutdown.
    pub fn cancel_all(&self) {
        for slot in self.lock().values_mut() {
            if let Some((_, token)) = slot.running.take() {
                token.cancel();
            }
        }
    }
}

/// Held for the lifetime of one pipeline run.
pub struct PipelineGuard {
    slots: Arc<Mutex<HashMap<Uuid, SessionSlot>>>,
    session_id: Uuid,
    query_id: Uuid,
    token: CancellationToken,
}

impl PipelineGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn query_id(&self) -> Uuid {
        self.query_id
    }
}

impl Drop for PipelineGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = slots.get_mut(&self.session_id) {
            let ours = matches!(&slot.running, Some((id, _)) if *id == self.query_id);
            if ours {
                slot.running = None;
            }
        }
    }
}
