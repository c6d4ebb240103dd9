//! Action request state machine
//!
//! State lives on the request itself. Every move appends a transition to
//! the request's history; illegal moves leave the request untouched.

use crate::error::OrchestrationError;
use crate::models::{ActionRequest, ActionState, ActionTransition, ActionVerb, Query};
use crate::Result;
use chrono::Utc;
use std::collections::BTreeMap;
use uuid::Uuid;

impl ActionState {
    pub fn can_transition_to(self, next: ActionState) -> bool {
        use ActionState::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Approved, Dispatched) | (Approved, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionState::Rejected | ActionState::Dispatched | ActionState::Failed
        )
    }
}

impl ActionRequest {
    /// A new `pending` request. The creation itself is the first history entry.
    pub fn new(
        query: &Query,
        verb: ActionVerb,
        target: Option<String>,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        let request_id = Uuid::new_v4();

        let created = ActionTransition {
            request_id,
            query_id: query.query_id,
            session_id: query.session_id,
            from: None,
            to: ActionState::Pending,
            actor: query.requester.clone(),
            note: None,
            at: now,
        };

        Self {
            request_id,
            query_id: query.query_id,
            session_id: query.session_id,
            verb,
            target,
            parameters,
            state: ActionState::Pending,
            requester: query.requester.clone(),
            original_query: query.text.clone(),
            created_at: now,
            updated_at: now,
            history: vec![created],
        }
    }

    pub fn approve(&mut self, actor: &str) -> Result<ActionTransition> {
        self.transition(ActionState::Approved, actor, None)
    }

    pub fn reject(&mut self, actor: &str, reason: Option<String>) -> Result<ActionTransition> {
        self.transition(ActionState::Rejected, actor, reason)
    }

    pub fn mark_dispatched(&mut self, actor: &str, note: Option<String>) -> Result<ActionTransition> {
        self.transition(ActionState::Dispatched, actor, note)
    }

    pub fn mark_failed(&mut self, actor: &str, reason: String) -> Result<ActionTransition> {
        self.transition(ActionState::Failed, actor, Some(reason))
    }

    pub fn transition(
        &mut self,
        to: ActionState,
        actor: &str,
        note: Option<String>,
    ) -> Result<ActionTransition> {
        if !self.state.can_transition_to(to) {
            return Err(OrchestrationError::InvalidTransition {
                from: self.state,
                to,
            });
        }

        let now = Utc::now();
        let record = ActionTransition {
            request_id: self.request_id,
            query_id: self.query_id,
            session_id: self.session_id,
            from: Some(self.state),
            to,
            actor: actor.to_string(),
            note,
            at: now,
        };

        self.state = to;
        self.updated_at = now;
        self.history.push(record.clone());
        Ok(record)
    }

    pub fn was_approved(&self) -> bool {
        self.history.iter().any(|t| t.to == ActionState::Approved)
    }

    /// One-line description for confirmations and logs.
    pub fn describe(&self) -> String {
        let mut out = self.verb.as_str().replace('_', " ");
        if let Some(target) = &self.target {
            out.push_str(&format!(" \"{}\"", target));
        }
        for (key, value) in &self.parameters {
            out.push_str(&format!(" {}={}", key, value));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ActionRequest {
        let query = Query::new("pause 'daily backup process'").with_requester("ops_lead");
        ActionRequest::new(
            &query,
            ActionVerb::Pause,
            Some("daily backup process".to_string()),
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_creation_is_recorded() {
        let req = request();
        assert_eq!(req.state, ActionState::Pending);
        assert_eq!(req.history.len(), 1);
        assert_eq!(req.history[0].from, None);
        assert_eq!(req.history[0].actor, "ops_lead");
    }

    #[test]
    fn test_happy_path() {
        let mut req = request();
        req.approve("reviewer").unwrap();
        let t = req.mark_dispatched("system", Some("200 OK".into())).unwrap();

        assert_eq!(t.from, Some(ActionState::Approved));
        assert_eq!(req.state, ActionState::Dispatched);
        assert!(req.was_approved());
        assert_eq!(req.history.len(), 3);
    }

    #[test]
    fn test_pending_cannot_dispatch() {
        let mut req = request();
        let err = req.mark_dispatched("system", None).unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::InvalidTransition {
                from: ActionState::Pending,
                to: ActionState::Dispatched
            }
        ));
        assert_eq!(req.state, ActionState::Pending);
        assert_eq!(req.history.len(), 1);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut req = request();
        req.reject("reviewer", Some("wrong item".into())).unwrap();
        assert!(req.state.is_terminal());
        assert!(req.approve("reviewer").is_err());
        assert!(req.mark_failed("system", "x".into()).is_err());
    }

    #[test]
    fn test_describe() {
        let mut req = request();
        req.parameters.insert("reason".into(), "stockout".into());
        assert_eq!(req.describe(), "pause \"daily backup process\" reason=stockout");
    }
}
