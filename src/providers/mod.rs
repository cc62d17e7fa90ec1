pub mod openai_compatible;

pub use openai_compatible::{OpenAiCompatibleProvider, UpstreamDialect};

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::Result;
use crate::config::CredentialKeyConfig;
use crate::types::{ChatRequest, ChatResponse, StreamEvent};

pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

/// One upstream wire adapter. Adapters marshal the unified request into their
/// dialect and unmarshal the response back; they never see governance state
/// and never apply timeouts (the dispatcher owns those).
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Unary call. `model` is the bare upstream model id, already stripped of
    /// the gateway namespace.
    async fn chat(
        &self,
        request: &ChatRequest,
        model: &str,
        key: &CredentialKeyConfig,
    ) -> Result<ChatResponse>;

    /// Opens an event stream; chunks are decoded incrementally into canonical
    /// events.
    async fn chat_stream(
        &self,
        request: &ChatRequest,
        model: &str,
        key: &CredentialKeyConfig,
    ) -> Result<EventStream>;
}
