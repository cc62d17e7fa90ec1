use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::governance::store::ResolvedRequest;
use crate::types::{ChatRequest, ChatResponse, ModelRef, Usage};

/// What a plugin contributes; chains skip plugins that opt out of a slot.
#[derive(Clone, Copy, Debug, Default)]
pub struct PluginCapabilities {
    pub pre_hook: bool,
    pub post_hook: bool,
    pub transport_middleware: bool,
}

/// Mutable per-request state threaded through the hook chains and the
/// dispatcher.
pub struct RequestContext {
    pub request_id: String,
    pub vk_value: String,
    pub model: ModelRef,
    /// Operation key checked against each provider's `allowed_requests`.
    pub operation: &'static str,
    /// Set by the governance pre-hook after admission.
    pub resolved: Option<ResolvedRequest>,
    /// Set when a stream's terminal chunk carried a usage payload.
    pub stream_end_seen: bool,
    /// Usage observed on the response or assembled from stream chunks.
    pub usage: Option<Usage>,
    /// Cost reported by the upstream, when it reports one.
    pub reported_cost: Option<f64>,
}

impl RequestContext {
    pub fn new(vk_value: impl Into<String>, model: ModelRef, operation: &'static str) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            vk_value: vk_value.into(),
            model,
            operation,
            resolved: None,
            stream_end_seen: false,
            usage: None,
            reported_cost: None,
        }
    }
}

pub enum PreHookOutcome {
    /// Pass the (possibly transformed) request to the next plugin.
    Continue(ChatRequest),
    /// Answer without calling the provider; treated as the provider's
    /// response from this plugin outward.
    ShortCircuit(ChatResponse),
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities {
            pre_hook: true,
            post_hook: true,
            transport_middleware: false,
        }
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn pre_hook(
        &self,
        _ctx: &mut RequestContext,
        request: ChatRequest,
    ) -> Result<PreHookOutcome> {
        Ok(PreHookOutcome::Continue(request))
    }

    async fn post_hook(
        &self,
        _ctx: &mut RequestContext,
        outcome: Result<ChatResponse>,
    ) -> Result<ChatResponse> {
        outcome
    }

    async fn cleanup(&self) {}
}

/// Outcome of the pre-hook chain: either dispatch upstream, or a plugin
/// answered and only the post-hook tail below it must run.
pub enum PreChainOutcome {
    Dispatch(ChatRequest),
    ShortCircuit { index: usize, response: ChatResponse },
}

/// Ordered plugin composition. Pre-hooks run in declared order; post-hooks in
/// reverse. A short-circuit at plugin `i` skips the remaining pre-hooks and
/// starts the post-hook chain at `i`, so earlier plugins still observe the
/// response on its way out.
#[derive(Clone, Default)]
pub struct PluginPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginPipeline {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    pub async fn init(&self) -> Result<()> {
        for plugin in &self.plugins {
            plugin.init().await?;
        }
        Ok(())
    }

    pub async fn run_pre(
        &self,
        ctx: &mut RequestContext,
        mut request: ChatRequest,
    ) -> Result<PreChainOutcome> {
        for (index, plugin) in self.plugins.iter().enumerate() {
            if !plugin.capabilities().pre_hook {
                continue;
            }
            match plugin.pre_hook(ctx, request).await? {
                PreHookOutcome::Continue(next) => request = next,
                PreHookOutcome::ShortCircuit(response) => {
                    return Ok(PreChainOutcome::ShortCircuit { index, response });
                }
            }
        }
        Ok(PreChainOutcome::Dispatch(request))
    }

    /// Runs post-hooks from `from_index` down to 0 inclusive.
    pub async fn run_post(
        &self,
        from_index: usize,
        ctx: &mut RequestContext,
        mut outcome: Result<ChatResponse>,
    ) -> Result<ChatResponse> {
        if self.plugins.is_empty() {
            return outcome;
        }
        for index in (0..=from_index.min(self.plugins.len() - 1)).rev() {
            let plugin = &self.plugins[index];
            if !plugin.capabilities().post_hook {
                continue;
            }
            outcome = plugin.post_hook(ctx, outcome).await;
        }
        outcome
    }

    pub async fn run_post_all(
        &self,
        ctx: &mut RequestContext,
        outcome: Result<ChatResponse>,
    ) -> Result<ChatResponse> {
        if self.plugins.is_empty() {
            return outcome;
        }
        self.run_post(self.plugins.len() - 1, ctx, outcome).await
    }

    /// Cleanup runs in reverse declared order, mirroring the post-hook chain.
    pub async fn cleanup(&self) {
        for plugin in self.plugins.iter().rev() {
            plugin.cleanup().await;
        }
    }
}
