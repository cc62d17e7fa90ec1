use async_trait::async_trait;

use crate::Result;
use crate::error::GatewayError;
use crate::plugin::{Plugin, PreHookOutcome, RequestContext};
use crate::types::{ChatRequest, ChatResponse};

/// Structured request logging. Cancellations are not errors and are logged at
/// debug level only.
#[derive(Debug, Default)]
pub struct RequestLogPlugin;

#[async_trait]
impl Plugin for RequestLogPlugin {
    fn name(&self) -> &'static str {
        "request-log"
    }

    async fn pre_hook(
        &self,
        ctx: &mut RequestContext,
        request: ChatRequest,
    ) -> Result<PreHookOutcome> {
        tracing::info!(
            request_id = %ctx.request_id,
            model = %ctx.model,
            operation = ctx.operation,
            stream = request.stream,
            "request admitted to pipeline"
        );
        Ok(PreHookOutcome::Continue(request))
    }

    async fn post_hook(
        &self,
        ctx: &mut RequestContext,
        outcome: Result<ChatResponse>,
    ) -> Result<ChatResponse> {
        match &outcome {
            Ok(response) => {
                tracing::info!(
                    request_id = %ctx.request_id,
                    model = %ctx.model,
                    total_tokens = response.usage.total_tokens,
                    "request completed"
                );
            }
            Err(GatewayError::Cancelled) => {
                tracing::debug!(request_id = %ctx.request_id, "request cancelled");
            }
            Err(err) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    model = %ctx.model,
                    error = %err,
                    "request failed"
                );
            }
        }
        outcome
    }
}
