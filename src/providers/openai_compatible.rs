use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::Value;

use crate::Result;
use crate::config::{CredentialKeyConfig, ProviderRuntimeConfig};
use crate::error::GatewayError;
use crate::reshape;
use crate::types::{ChatRequest, ChatResponse, StreamEvent};
use crate::utils::sse::sse_data_stream_from_response;

use super::{EventStream, Provider};

/// Which dialect the upstream natively speaks. A Responses upstream still
/// serves chat-completion traffic: the request and the stream are reshaped
/// through the canonical event set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamDialect {
    ChatCompletions,
    Responses,
}

/// Adapter for any OpenAI-compatible HTTP upstream (OpenAI itself, Azure
/// OpenAI deployments, Groq, local inference servers, ...).
pub struct OpenAiCompatibleProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
    extra_headers: BTreeMap<String, String>,
    dialect: UpstreamDialect,
}

impl OpenAiCompatibleProvider {
    pub fn new(name: impl Into<String>, runtime: &ProviderRuntimeConfig) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
            base_url: runtime.base_url.trim_end_matches('/').to_string(),
            extra_headers: runtime.extra_headers.clone(),
            dialect: UpstreamDialect::ChatCompletions,
        }
    }

    pub fn with_dialect(mut self, dialect: UpstreamDialect) -> Self {
        self.dialect = dialect;
        self
    }

    fn endpoint(&self) -> String {
        match self.dialect {
            UpstreamDialect::ChatCompletions => format!("{}/chat/completions", self.base_url),
            UpstreamDialect::Responses => format!("{}/responses", self.base_url),
        }
    }

    /// The outbound body: the client request minus gateway-only fields, with
    /// the bare model substituted and, for a Responses upstream, reshaped
    /// into that dialect.
    fn upstream_body(&self, request: &ChatRequest, model: &str, stream: bool) -> Result<Value> {
        let mut body = serde_json::to_value(request)?;
        let obj = body
            .as_object_mut()
            .ok_or_else(|| GatewayError::Internal("request must serialize to an object".into()))?;
        obj.remove("fallbacks");
        obj.insert("model".to_string(), Value::String(model.to_string()));
        if stream {
            obj.insert("stream".to_string(), Value::Bool(true));
            obj.insert(
                "stream_options".to_string(),
                serde_json::json!({ "include_usage": true }),
            );
        } else {
            obj.remove("stream");
        }

        match self.dialect {
            UpstreamDialect::ChatCompletions => Ok(body),
            UpstreamDialect::Responses => reshape::chat_request_to_responses_body(&body)
                .ok_or_else(|| {
                    GatewayError::InvalidRequest {
                        reason: "request cannot be expressed in the responses dialect".to_string(),
                    }
                }),
        }
    }

    async fn send(&self, body: &Value, key: &CredentialKeyConfig) -> Result<reqwest::Response> {
        self.finish_send(self.client.post(self.endpoint()).json(body), key)
            .await
    }

    /// Raw pass-through: the client's bytes go upstream unchanged.
    async fn send_raw(
        &self,
        body: bytes::Bytes,
        key: &CredentialKeyConfig,
    ) -> Result<reqwest::Response> {
        let builder = self
            .client
            .post(self.endpoint())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        self.finish_send(builder, key).await
    }

    async fn finish_send(
        &self,
        builder: reqwest::RequestBuilder,
        key: &CredentialKeyConfig,
    ) -> Result<reqwest::Response> {
        let mut builder = builder.bearer_auth(&key.secret);
        for (name, value) in &self.extra_headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

fn now_epoch_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        model: &str,
        key: &CredentialKeyConfig,
    ) -> Result<ChatResponse> {
        let response = match (&request.raw_body, self.dialect) {
            (Some(raw), UpstreamDialect::ChatCompletions) => {
                self.send_raw(raw.clone(), key).await?
            }
            _ => {
                let body = self.upstream_body(request, model, false)?;
                self.send(&body, key).await?
            }
        };
        let raw: Value = response.json().await?;

        match self.dialect {
            UpstreamDialect::ChatCompletions => Ok(serde_json::from_value(raw)?),
            UpstreamDialect::Responses => reshape::responses_response_to_chat(
                &raw,
                now_epoch_seconds(),
            )
            .ok_or_else(|| {
                GatewayError::InvalidResponse("malformed responses payload".to_string())
            }),
        }
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        model: &str,
        key: &CredentialKeyConfig,
    ) -> Result<EventStream> {
        let body = self.upstream_body(request, model, true)?;
        let response = self.send(&body, key).await?;

        let dialect = self.dialect;
        let events = sse_data_stream_from_response(response)
            .flat_map(move |frame| {
                let events: Vec<Result<StreamEvent>> = match frame {
                    Ok(data) => match serde_json::from_str::<Value>(&data) {
                        Ok(value) => {
                            let decoded = match dialect {
                                UpstreamDialect::ChatCompletions => {
                                    reshape::decode_chat_chunk(&value)
                                }
                                UpstreamDialect::Responses => {
                                    reshape::decode_responses_event(&value)
                                }
                            };
                            decoded.into_iter().map(Ok).collect()
                        }
                        Err(err) => vec![Err(GatewayError::InvalidResponse(format!(
                            "malformed stream chunk: {err}"
                        )))],
                    },
                    Err(err) => vec![Err(err)],
                };
                stream::iter(events)
            })
            // The upstream `[DONE]` sentinel ends the SSE stream itself; a
            // trailing Done marks termination for dialects that have no
            // explicit completed event. Consumers stop at the first terminal
            // event, so a duplicate is harmless.
            .chain(stream::once(std::future::ready(Ok(StreamEvent::Done))));

        Ok(Box::pin(events))
    }
}
