use ops_copilot::config::RetrievalConfig;
use ops_copilot::critic::grounding_score;
use ops_copilot::retrieval::{HashingEmbedder, InMemoryIndex, Retriever};
use ops_copilot::{ActionRequest, ActionState, ActionVerb, Chunk, ChunkMetadata, Query};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

fn any_state() -> impl Strategy<Value = ActionState> {
    prop_oneof![
        Just(ActionState::Pending),
        Just(ActionState::Approved),
        Just(ActionState::Rejected),
        Just(ActionState::Dispatched),
        Just(ActionState::Failed),
    ]
}

fn fresh_request() -> ActionRequest {
    ActionRequest::new(
        &Query::new("pause 'daily backup process'"),
        ActionVerb::Pause,
        Some("daily backup process".to_string()),
        BTreeMap::new(),
    )
}

fn ranked_ids(texts: &[String], query: &str, k: usize) -> Vec<Vec<(String, f32)>> {
    tokio_test::block_on(async {
        let embedder = Arc::new(HashingEmbedder::default());
        let chunks = texts
            .iter()
            .enumerate()
            .map(|(i, text)| Chunk {
                chunk_id: format!("doc_c{}", i),
                document_id: "doc".to_string(),
                text: text.clone(),
                metadata: ChunkMetadata::default(),
            })
            .collect();
        let index = InMemoryIndex::from_chunks(chunks, embedder.as_ref())
            .await
            .expect("index builds");
        let retriever = Retriever::new(Arc::new(index), embedder, &RetrievalConfig::default());

        let query = Query::new(query);
        let mut runs = Vec::new();
        for _ in 0..2 {
            let ranked = retriever.retrieve(&query, k).await.expect("retrieval succeeds");
            runs.push(
                ranked
                    .iter()
                    .map(|c| (c.id().to_string(), c.score))
                    .collect(),
            );
        }
        runs
    })
}

proptest! {
    #[test]
    fn dispatch_is_never_reached_without_approval(steps in prop::collection::vec(any_state(), 0..12)) {
        let mut request = fresh_request();
        for to in steps {
            let before = request.state;
            let accepted = request.transition(to, "tester", None).is_ok();
            prop_assert_eq!(accepted, before.can_transition_to(to));
            if !accepted {
                prop_assert_eq!(request.state, before);
            }
        }

        if matches!(request.state, ActionState::Dispatched | ActionState::Failed) {
            prop_assert!(request.was_approved());
        }
        prop_assert!(request
            .history
            .iter()
            .all(|t| !(t.from == Some(ActionState::Pending) && t.to == ActionState::Dispatched)));
    }

    #[test]
    fn history_is_a_connected_chain(steps in prop::collection::vec(any_state(), 0..12)) {
        let mut request = fresh_request();
        for to in steps {
            let _ = request.transition(to, "tester", None);
        }

        prop_assert_eq!(request.history.first().map(|t| t.from), Some(None));
        for pair in request.history.windows(2) {
            prop_assert_eq!(pair[1].from, Some(pair[0].to));
        }
        prop_assert_eq!(request.history.last().map(|t| t.to), Some(request.state));
    }

    #[test]
    fn terminal_states_accept_nothing(state in any_state(), next in any_state()) {
        if state.is_terminal() {
            prop_assert!(!state.can_transition_to(next));
        }
    }

    #[test]
    fn grounding_score_stays_in_unit_range(
        supported in 0usize..50,
        extra in 0usize..50,
        retrieved in 0usize..10,
    ) {
        let total = supported + extra;
        let score = grounding_score(supported, total, retrieved);
        prop_assert!((0.0..=1.0).contains(&score));
        if total > 0 && retrieved > 0 && extra == 0 {
            prop_assert_eq!(score, 1.0);
        }
    }

    #[test]
    fn retrieval_order_is_repeatable(
        texts in prop::collection::vec("[a-z]{3,8}( [a-z]{3,8}){0,6}", 1..10),
        query in "[a-z]{3,8}( [a-z]{3,8}){0,3}",
        k in 1usize..6,
    ) {
        let runs = ranked_ids(&texts, &query, k);
        prop_assert_eq!(&runs[0], &runs[1]);
        prop_assert!(runs[0].windows(2).all(|w| w[0].1 >= w[1].1));
    }
}
