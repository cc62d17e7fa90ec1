pub mod config;
pub mod dispatcher;
mod error;
pub mod governance;
pub mod http;
pub mod pipeline;
pub mod plugin;
pub mod plugins;
pub mod providers;
pub mod registry;
pub mod reshape;
pub mod session;
pub mod telemetry;
pub mod types;
pub mod utils;

pub use error::{GatewayError, QuotaScope, RateDimension, Result};

pub use config::{
    CredentialKeyConfig, GatewayConfig, ProviderEntryConfig, ProviderRuntimeConfig,
};
pub use dispatcher::{Dispatcher, STREAM_CHANNEL_CAPACITY};
pub use governance::{
    BudgetSpec, Clock, CreateCustomerRequest, CreateTeamRequest, CreateVirtualKeyRequest,
    Governance, ProviderConfigSpec, RateLimitSpec, SystemClock, UpdateCustomerRequest,
    UpdateTeamRequest, UpdateVirtualKeyRequest,
};
pub use http::{GatewayHttpState, router};
pub use pipeline::{ChunkStream, Gateway};
pub use plugin::{Plugin, PluginCapabilities, PluginPipeline, PreHookOutcome, RequestContext};
pub use providers::{OpenAiCompatibleProvider, Provider, UpstreamDialect};
pub use registry::ProviderRegistry;
pub use session::{AdminCredential, SessionManager};
pub use types::{
    ChatChoice, ChatMessage, ChatRequest, ChatResponse, Fallback, ModelRef, StreamChunk,
    StreamEvent, Usage,
};
