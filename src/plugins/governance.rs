//! Governance as a plugin: admission in the pre-hook, usage recording in the
//! post-hook. Mounting it first in the chain means no other plugin (and no
//! provider) runs for a denied request, while its post-hook runs last so it
//! observes the final usage numbers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::governance::Governance;
use crate::plugin::{Plugin, PreHookOutcome, RequestContext};
use crate::types::{ChatRequest, ChatResponse};

pub struct GovernancePlugin {
    governance: Arc<Governance>,
}

impl GovernancePlugin {
    pub fn new(governance: Arc<Governance>) -> Self {
        Self { governance }
    }
}

#[async_trait]
impl Plugin for GovernancePlugin {
    fn name(&self) -> &'static str {
        "governance"
    }

    async fn pre_hook(
        &self,
        ctx: &mut RequestContext,
        request: ChatRequest,
    ) -> Result<PreHookOutcome> {
        let resolved = self.governance.admit(&ctx.vk_value, &ctx.model)?;
        ctx.resolved = Some(resolved);
        Ok(PreHookOutcome::Continue(request))
    }

    async fn post_hook(
        &self,
        ctx: &mut RequestContext,
        outcome: Result<ChatResponse>,
    ) -> Result<ChatResponse> {
        // Usage is charged only for successful responses; denied or failed
        // requests never consumed the upstream.
        if let (Ok(response), Some(resolved)) = (&outcome, &ctx.resolved) {
            let tokens = ctx
                .usage
                .as_ref()
                .map(|usage| usage.total_tokens)
                .unwrap_or(response.usage.total_tokens);
            self.governance
                .record_usage(resolved, tokens, ctx.reported_cost);
        }
        outcome
    }

    async fn cleanup(&self) {
        self.governance.shutdown().await;
    }
}
