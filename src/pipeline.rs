use std::sync::Arc;

use futures_util::stream::{self, BoxStream};

use crate::Result;
use crate::dispatcher::Dispatcher;
use crate::error::GatewayError;
use crate::governance::Governance;
use crate::plugin::{Plugin, PluginPipeline, PreChainOutcome, RequestContext};
use crate::plugins::{GovernancePlugin, RequestLogPlugin};
use crate::registry::ProviderRegistry;
use crate::types::{ChatRequest, ChatResponse, Fallback, StreamChunk, StreamEvent, Usage};

pub type ChunkStream = BoxStream<'static, Result<StreamChunk>>;

/// The dispatch core: plugin chains around key selection, worker-pool
/// dispatch, and retry-with-fallback.
pub struct Gateway {
    plugins: PluginPipeline,
    registry: Arc<ProviderRegistry>,
    dispatcher: Dispatcher,
}

impl Gateway {
    pub fn new(registry: Arc<ProviderRegistry>, plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self {
            plugins: PluginPipeline::new(plugins),
            registry,
            dispatcher: Dispatcher::new(),
        }
    }

    /// Standard chain: governance first (admission runs before anything else,
    /// usage recording runs last on the way out), then request logging.
    pub fn with_default_plugins(
        registry: Arc<ProviderRegistry>,
        governance: Arc<Governance>,
    ) -> Self {
        Self::new(
            registry,
            vec![
                Arc::new(GovernancePlugin::new(governance)),
                Arc::new(RequestLogPlugin),
            ],
        )
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub async fn init(&self) -> Result<()> {
        self.plugins.init().await
    }

    /// Runs plugin cleanup in reverse order; governance flushes its pending
    /// usage deltas here.
    pub async fn shutdown(&self) {
        self.plugins.cleanup().await;
    }

    fn attempts(&self, ctx: &RequestContext, request: &ChatRequest) -> Vec<Fallback> {
        let mut attempts = Vec::with_capacity(1 + request.fallbacks.len());
        attempts.push(Fallback {
            provider: ctx.model.provider.clone(),
            model: ctx.model.model.clone(),
        });
        attempts.extend(request.fallbacks.iter().cloned());
        attempts
    }

    /// Errors that advance the fallback iterator: transient upstream kinds,
    /// plus per-provider conditions another provider might not share.
    fn advances_fallback(err: &GatewayError) -> bool {
        err.is_retryable()
            || matches!(
                err,
                GatewayError::NoKeyForModel { .. }
                    | GatewayError::ProviderNotFound { .. }
                    | GatewayError::Dropped { .. }
            )
    }

    pub async fn chat(
        &self,
        ctx: &mut RequestContext,
        request: ChatRequest,
    ) -> Result<ChatResponse> {
        let request = match self.plugins.run_pre(ctx, request).await {
            Ok(PreChainOutcome::Dispatch(request)) => request,
            Ok(PreChainOutcome::ShortCircuit { index, response }) => {
                return self.plugins.run_post(index, ctx, Ok(response)).await;
            }
            Err(err) => {
                return self.plugins.run_post_all(ctx, Err(err)).await;
            }
        };

        let outcome = self.dispatch_unary_with_fallbacks(ctx, &request).await;
        if let Ok(response) = &outcome {
            ctx.usage = Some(response.usage.clone());
        }
        self.plugins.run_post_all(ctx, outcome).await
    }

    async fn dispatch_unary_with_fallbacks(
        &self,
        ctx: &RequestContext,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        let mut last_err: Option<GatewayError> = None;
        for attempt in self.attempts(ctx, request) {
            match self.dispatch_unary_once(ctx, request, &attempt).await {
                Ok(response) => return Ok(response),
                Err(err) if Self::advances_fallback(&err) => {
                    tracing::debug!(
                        request_id = %ctx.request_id,
                        provider = %attempt.provider,
                        model = %attempt.model,
                        error = %err,
                        "attempt failed; advancing to next fallback"
                    );
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(GatewayError::Internal("no dispatch attempt ran".to_string())))
    }

    async fn dispatch_unary_once(
        &self,
        ctx: &RequestContext,
        request: &ChatRequest,
        attempt: &Fallback,
    ) -> Result<ChatResponse> {
        let registered = self.registry.get(&attempt.provider)?;
        if !registered.runtime.allows_operation(ctx.operation) {
            return Err(GatewayError::UnsupportedOperation {
                operation: ctx.operation.to_string(),
            });
        }
        let key = self.registry.select_key(&attempt.provider, &attempt.model)?;
        let mut response = self
            .dispatcher
            .dispatch_unary(
                &attempt.provider,
                &registered.adapter,
                &key,
                &registered.runtime,
                request.clone(),
                attempt.model.clone(),
            )
            .await?;
        if !registered.runtime.send_back_raw_response {
            response.raw_response = None;
        }
        Ok(response)
    }

    /// Opens a stream with fallback on open failure. Once the first chunk can
    /// flow, the chosen provider is committed; post-hooks (governance usage
    /// recording included) run when the terminal chunk passes through.
    pub async fn chat_stream(
        &self,
        mut ctx: RequestContext,
        request: ChatRequest,
    ) -> Result<ChunkStream> {
        let request = match self.plugins.run_pre(&mut ctx, request).await {
            Ok(PreChainOutcome::Dispatch(request)) => request,
            Ok(PreChainOutcome::ShortCircuit { index, response }) => {
                // A synthetic response streams as one content chunk plus its
                // usage, then terminates.
                let response = self.plugins.run_post(index, &mut ctx, Ok(response)).await?;
                return Ok(synthetic_stream(response));
            }
            Err(err) => {
                let err = self
                    .plugins
                    .run_post_all(&mut ctx, Err(err))
                    .await
                    .err()
                    .unwrap_or(GatewayError::Internal(
                        "post-hook swallowed pre-hook error".to_string(),
                    ));
                return Err(err);
            }
        };

        let mut last_err: Option<GatewayError> = None;
        let mut opened = None;
        for attempt in self.attempts(&ctx, &request) {
            match self.dispatch_stream_once(&ctx, &request, &attempt).await {
                Ok(chunks) => {
                    opened = Some(chunks);
                    break;
                }
                Err(err) if Self::advances_fallback(&err) => {
                    tracing::debug!(
                        request_id = %ctx.request_id,
                        provider = %attempt.provider,
                        error = %err,
                        "stream open failed; advancing to next fallback"
                    );
                    last_err = Some(err);
                }
                Err(err) => {
                    return match self.plugins.run_post_all(&mut ctx, Err(err)).await {
                        Ok(response) => Ok(synthetic_stream(response)),
                        Err(err) => Err(err),
                    };
                }
            }
        }
        let Some(chunks) = opened else {
            let err = last_err
                .unwrap_or(GatewayError::Internal("no dispatch attempt ran".to_string()));
            return match self.plugins.run_post_all(&mut ctx, Err(err)).await {
                Ok(response) => Ok(synthetic_stream(response)),
                Err(err) => Err(err),
            };
        };

        Ok(self.accounted_stream(ctx, chunks))
    }

    async fn dispatch_stream_once(
        &self,
        ctx: &RequestContext,
        request: &ChatRequest,
        attempt: &Fallback,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamChunk>>> {
        let registered = self.registry.get(&attempt.provider)?;
        if !registered.runtime.allows_operation(ctx.operation) {
            return Err(GatewayError::UnsupportedOperation {
                operation: ctx.operation.to_string(),
            });
        }
        let key = self.registry.select_key(&attempt.provider, &attempt.model)?;
        self.dispatcher
            .dispatch_stream(
                &attempt.provider,
                &registered.adapter,
                &key,
                &registered.runtime,
                request.clone(),
                attempt.model.clone(),
            )
            .await
    }

    /// Wraps the raw chunk channel with usage accounting: usage events
    /// accumulate into the context, and the post-hook chain fires exactly
    /// once when the terminal chunk is observed.
    fn accounted_stream(
        &self,
        ctx: RequestContext,
        chunks: tokio::sync::mpsc::Receiver<Result<StreamChunk>>,
    ) -> ChunkStream {
        struct StreamState {
            chunks: tokio::sync::mpsc::Receiver<Result<StreamChunk>>,
            ctx: RequestContext,
            plugins: PluginPipeline,
            usage: Usage,
            finished: bool,
        }

        async fn finish(state: &mut StreamState, failure: Option<String>) {
            if state.finished {
                return;
            }
            state.finished = true;
            state.ctx.usage = Some(state.usage.clone());
            let outcome = match failure {
                Some(message) => Err(GatewayError::InvalidResponse(message)),
                None => Ok(ChatResponse::assistant_text(
                    state.ctx.request_id.clone(),
                    state.ctx.model.to_string(),
                    0,
                    String::new(),
                    state.usage.clone(),
                )),
            };
            let _ = state.plugins.run_post_all(&mut state.ctx, outcome).await;
        }

        let state = StreamState {
            chunks,
            ctx,
            plugins: self.plugins.clone(),
            usage: Usage::default(),
            finished: false,
        };

        Box::pin(stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            match state.chunks.recv().await {
                Some(Ok(chunk)) => {
                    match &chunk.event {
                        StreamEvent::Usage(usage) => {
                            state.usage.merge(usage);
                            state.ctx.stream_end_seen = true;
                        }
                        StreamEvent::Done => {
                            finish(&mut state, None).await;
                        }
                        StreamEvent::TerminalError { message } => {
                            finish(&mut state, Some(message.clone())).await;
                        }
                        _ => {}
                    }
                    Some((Ok(chunk), state))
                }
                Some(Err(err)) => {
                    finish(&mut state, Some(err.to_string())).await;
                    Some((Err(err), state))
                }
                None => {
                    finish(&mut state, Some("stream closed without terminal chunk".to_string()))
                        .await;
                    None
                }
            }
        }))
    }
}

/// One content chunk, a usage chunk, then done; used when a pre-hook plugin
/// answers without the provider.
fn synthetic_stream(response: ChatResponse) -> ChunkStream {
    let provider = "plugin".to_string();
    let model = response.model.clone();
    let text = response.text();
    let mut events = Vec::new();
    if !text.is_empty() {
        events.push(StreamEvent::ContentDelta { text });
    }
    events.push(StreamEvent::Usage(response.usage.clone()));
    events.push(StreamEvent::Done);

    let chunks: Vec<Result<StreamChunk>> = events
        .into_iter()
        .enumerate()
        .map(|(index, event)| {
            Ok(StreamChunk {
                chunk_index: index as u64,
                provider: provider.clone(),
                model: model.clone(),
                latency_ms: 0,
                event,
            })
        })
        .collect();
    Box::pin(stream::iter(chunks))
}
