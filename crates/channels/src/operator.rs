//! Operator inbox: decision requests waiting for a human.
//!
//! The engine's approval gate posts a request here; the operator reads the
//! queue over HTTP and answers through the decision endpoint. Answered or
//! expired drafts are dropped from the queue by whoever resolves them.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use dripline_core::delivery::{DecisionNotifier, DecisionRequest};

#[derive(Default)]
pub struct OperatorInbox {
    pending: DashMap<Uuid, DecisionRequest>,
}

impl OperatorInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outstanding requests, soonest deadline first.
    pub fn pending(&self) -> Vec<DecisionRequest> {
        let mut requests: Vec<_> = self.pending.iter().map(|r| r.value().clone()).collect();
        requests.sort_by_key(|r| r.respond_by);
        requests
    }

    pub fn get(&self, draft_id: Uuid) -> Option<DecisionRequest> {
        self.pending.get(&draft_id).map(|r| r.value().clone())
    }

    /// Removes a request once its draft is resolved.
    pub fn dismiss(&self, draft_id: Uuid) -> Option<DecisionRequest> {
        self.pending.remove(&draft_id).map(|(_, request)| request)
    }
}

#[async_trait]
impl DecisionNotifier for OperatorInbox {
    async fn request_decision(&self, request: &DecisionRequest) -> anyhow::Result<()> {
        info!(
            draft_id = %request.draft_id,
            process_id = %request.process_id,
            chain_id = %request.chain_id,
            respond_by = %request.respond_by,
            "Decision requested"
        );
        metrics::counter!("operator.requests").increment(1);
        self.pending.insert(request.draft_id, request.clone());
        Ok(())
    }
}
