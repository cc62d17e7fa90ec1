//! Dialect translation around the canonical stream-event set.
//!
//! Provider adapters decode their native dialect (Chat Completions or
//! Responses) into [`StreamEvent`]s; the transport renders those events back
//! into whichever dialect the client asked for. A single upstream chunk that
//! carries both content and usage always decodes into two events, content
//! first, usage last, so consumers never see the two fused.

use serde_json::{Map, Value, json};

use crate::types::{ChatChoice, ChatMessage, ChatResponse, StreamEvent, Usage};

// ---- decoding: upstream wire -> canonical events ----

/// Decodes one `chat.completion.chunk` payload. Emission order within a
/// chunk is content, tool calls, then usage.
pub fn decode_chat_chunk(raw: &Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    for choice in raw
        .get("choices")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let delta = choice.get("delta");
        if let Some(text) = delta
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
        {
            if !text.is_empty() {
                events.push(StreamEvent::ContentDelta {
                    text: text.to_string(),
                });
            }
        }
        for call in delta
            .and_then(|d| d.get("tool_calls"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string);
            let function = call.get("function");
            let name = function
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
                .map(str::to_string);
            let arguments = function
                .and_then(|f| f.get("arguments"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            events.push(StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            });
        }
    }

    if let Some(usage) = raw.get("usage").filter(|usage| !usage.is_null()) {
        if let Ok(usage) = serde_json::from_value::<Usage>(usage.clone()) {
            events.push(StreamEvent::Usage(usage));
        }
    }

    events
}

/// Decodes one Responses-dialect SSE event by its `type` discriminator.
pub fn decode_responses_event(raw: &Value) -> Vec<StreamEvent> {
    let event_type = raw.get("type").and_then(Value::as_str).unwrap_or_default();
    match event_type {
        "response.output_text.delta" => raw
            .get("delta")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
            .map(|text| {
                vec![StreamEvent::ContentDelta {
                    text: text.to_string(),
                }]
            })
            .unwrap_or_default(),
        "response.output_item.done" => {
            let Some(item) = raw.get("item") else {
                return Vec::new();
            };
            if item.get("type").and_then(Value::as_str) != Some("function_call") {
                return Vec::new();
            }
            let name = item
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if name.is_empty() {
                return Vec::new();
            }
            vec![StreamEvent::ToolCallDelta {
                index: 0,
                id: item
                    .get("call_id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string),
                name: Some(name),
                arguments: item
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}")
                    .to_string(),
            }]
        }
        "response.completed" => {
            let usage = raw
                .get("response")
                .and_then(|response| response.get("usage"))
                .map(responses_usage_to_usage);
            match usage {
                Some(usage) => vec![StreamEvent::Usage(usage), StreamEvent::Done],
                None => vec![StreamEvent::Done],
            }
        }
        "response.failed" => {
            let message = raw
                .get("response")
                .and_then(|response| response.get("error"))
                .map(|error| error.to_string())
                .unwrap_or_else(|| "upstream response failed".to_string());
            vec![StreamEvent::TerminalError { message }]
        }
        _ => Vec::new(),
    }
}

fn responses_usage_to_usage(raw: &Value) -> Usage {
    let prompt = raw
        .get("input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or_default();
    let completion = raw
        .get("output_tokens")
        .and_then(Value::as_u64)
        .unwrap_or_default();
    let total = raw
        .get("total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(prompt + completion);
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    }
}

// ---- rendering: canonical events -> client wire ----

/// Renders canonical events as `chat.completion.chunk` frames. Stateful per
/// stream: the assistant role is announced once, the finish chunk precedes
/// the usage-only chunk, and both precede the transport's `[DONE]`.
pub struct ChatChunkRenderer {
    id: String,
    model: String,
    created: u64,
    role_sent: bool,
    finish_sent: bool,
    pending_usage: Option<Usage>,
    saw_tool_calls: bool,
}

impl ChatChunkRenderer {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: u64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            role_sent: false,
            finish_sent: false,
            pending_usage: None,
            saw_tool_calls: false,
        }
    }

    fn frame(&self, choices: Value, usage: Option<&Usage>) -> Value {
        let mut out = Map::new();
        out.insert("id".to_string(), Value::String(self.id.clone()));
        out.insert(
            "object".to_string(),
            Value::String("chat.completion.chunk".to_string()),
        );
        out.insert("created".to_string(), json!(self.created));
        out.insert("model".to_string(), Value::String(self.model.clone()));
        out.insert("choices".to_string(), choices);
        if let Some(usage) = usage {
            out.insert("usage".to_string(), json!(usage));
        }
        Value::Object(out)
    }

    fn delta_frame(&mut self, mut delta: Map<String, Value>) -> Value {
        if !self.role_sent {
            self.role_sent = true;
            delta.insert("role".to_string(), Value::String("assistant".to_string()));
        }
        self.frame(
            json!([{ "index": 0, "delta": Value::Object(delta), "finish_reason": Value::Null }]),
            None,
        )
    }

    fn finish_frame(&mut self) -> Option<Value> {
        if self.finish_sent {
            return None;
        }
        self.finish_sent = true;
        let reason = if self.saw_tool_calls { "tool_calls" } else { "stop" };
        Some(self.frame(
            json!([{ "index": 0, "delta": {}, "finish_reason": reason }]),
            None,
        ))
    }

    pub fn render(&mut self, event: &StreamEvent) -> Vec<Value> {
        match event {
            StreamEvent::ContentDelta { text } => {
                let mut delta = Map::new();
                delta.insert("content".to_string(), Value::String(text.clone()));
                vec![self.delta_frame(delta)]
            }
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                self.saw_tool_calls = true;
                let mut call = Map::new();
                call.insert("index".to_string(), json!(index));
                if let Some(id) = id {
                    call.insert("id".to_string(), Value::String(id.clone()));
                    call.insert("type".to_string(), Value::String("function".to_string()));
                }
                let mut function = Map::new();
                if let Some(name) = name {
                    function.insert("name".to_string(), Value::String(name.clone()));
                }
                function.insert("arguments".to_string(), Value::String(arguments.clone()));
                call.insert("function".to_string(), Value::Object(function));

                let mut delta = Map::new();
                delta.insert("tool_calls".to_string(), json!([Value::Object(call)]));
                vec![self.delta_frame(delta)]
            }
            StreamEvent::Usage(usage) => {
                // Held back until the terminal event so the finish chunk can
                // precede the usage-only chunk, as the dialect requires.
                self.pending_usage = Some(usage.clone());
                Vec::new()
            }
            StreamEvent::Done => {
                let mut frames = Vec::new();
                if let Some(frame) = self.finish_frame() {
                    frames.push(frame);
                }
                if let Some(usage) = self.pending_usage.take() {
                    frames.push(self.frame(json!([]), Some(&usage)));
                }
                frames
            }
            StreamEvent::TerminalError { message } => {
                vec![json!({
                    "error": { "message": message, "type": "upstream_error" }
                })]
            }
        }
    }
}

/// Renders canonical events as Responses-dialect SSE events. The
/// `response.created` envelope leads, text deltas stream through, and the
/// usage payload rides the terminal `response.completed` event after every
/// buffered tool call item.
pub struct ResponsesEventRenderer {
    response_id: String,
    created_sent: bool,
    pending_usage: Option<Usage>,
    tool_calls: Vec<(Option<String>, String, String)>,
}

impl ResponsesEventRenderer {
    pub fn new(response_id: impl Into<String>) -> Self {
        Self {
            response_id: response_id.into(),
            created_sent: false,
            pending_usage: None,
            tool_calls: Vec::new(),
        }
    }

    fn created_frame(&mut self, out: &mut Vec<Value>) {
        if self.created_sent {
            return;
        }
        self.created_sent = true;
        out.push(json!({
            "type": "response.created",
            "response": { "id": self.response_id }
        }));
    }

    pub fn render(&mut self, event: &StreamEvent) -> Vec<Value> {
        let mut out = Vec::new();
        match event {
            StreamEvent::ContentDelta { text } => {
                self.created_frame(&mut out);
                out.push(json!({
                    "type": "response.output_text.delta",
                    "delta": text,
                }));
            }
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                self.created_frame(&mut out);
                let slot = *index as usize;
                while self.tool_calls.len() <= slot {
                    self.tool_calls.push((None, String::new(), String::new()));
                }
                let entry = &mut self.tool_calls[slot];
                if let Some(id) = id {
                    entry.0 = Some(id.clone());
                }
                if let Some(name) = name {
                    entry.1 = name.clone();
                }
                entry.2.push_str(arguments);
            }
            StreamEvent::Usage(usage) => {
                self.pending_usage = Some(usage.clone());
            }
            StreamEvent::Done => {
                self.created_frame(&mut out);
                for (slot, (id, name, arguments)) in self.tool_calls.drain(..).enumerate() {
                    if name.is_empty() {
                        continue;
                    }
                    let call_id = id.unwrap_or_else(|| format!("call_{slot}"));
                    let arguments = if arguments.is_empty() {
                        "{}".to_string()
                    } else {
                        arguments
                    };
                    out.push(json!({
                        "type": "response.output_item.done",
                        "item": {
                            "type": "function_call",
                            "call_id": call_id,
                            "name": name,
                            "arguments": arguments,
                        }
                    }));
                }
                let mut response = Map::new();
                response.insert("id".to_string(), Value::String(self.response_id.clone()));
                if let Some(usage) = self.pending_usage.take() {
                    response.insert(
                        "usage".to_string(),
                        json!({
                            "input_tokens": usage.prompt_tokens,
                            "output_tokens": usage.completion_tokens,
                            "total_tokens": usage.total_tokens,
                        }),
                    );
                }
                out.push(json!({
                    "type": "response.completed",
                    "response": Value::Object(response),
                }));
            }
            StreamEvent::TerminalError { message } => {
                self.created_frame(&mut out);
                out.push(json!({
                    "type": "response.failed",
                    "response": {
                        "id": self.response_id,
                        "error": { "message": message },
                    }
                }));
            }
        }
        out
    }
}

// ---- unary translation ----

/// Builds a Chat Completions body from a Responses-dialect create request.
pub fn responses_request_to_chat_body(request: &Value) -> Option<Value> {
    let obj = request.as_object()?;
    let mut out = Map::new();

    out.insert("model".to_string(), obj.get("model")?.clone());
    for (from, to) in [
        ("temperature", "temperature"),
        ("top_p", "top_p"),
        ("max_output_tokens", "max_tokens"),
        ("tools", "tools"),
        ("tool_choice", "tool_choice"),
    ] {
        if let Some(value) = obj.get(from) {
            out.insert(to.to_string(), value.clone());
        }
    }

    let stream = obj.get("stream").and_then(Value::as_bool).unwrap_or(false);
    if stream {
        out.insert("stream".to_string(), Value::Bool(true));
    }

    let mut messages = Vec::new();
    if let Some(instructions) = obj
        .get("instructions")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
    {
        messages.push(json!({ "role": "system", "content": instructions }));
    }
    match obj.get("input") {
        Some(Value::String(text)) if !text.trim().is_empty() => {
            messages.push(json!({ "role": "user", "content": text }));
        }
        Some(Value::Array(items)) => {
            for item in items {
                match item {
                    Value::String(text) if !text.trim().is_empty() => {
                        messages.push(json!({ "role": "user", "content": text }));
                    }
                    Value::Object(message) => {
                        let Some(role) = message
                            .get("role")
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .filter(|role| !role.is_empty())
                        else {
                            continue;
                        };
                        let content = flatten_content(message.get("content"));
                        messages.push(json!({ "role": role, "content": content }));
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    if messages.is_empty() {
        return None;
    }
    out.insert("messages".to_string(), Value::Array(messages));
    Some(Value::Object(out))
}

fn flatten_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => {
            let mut out = String::new();
            for part in parts {
                match part {
                    Value::String(text) => out.push_str(text),
                    Value::Object(obj) => {
                        if let Some(text) = obj.get("text").and_then(Value::as_str) {
                            out.push_str(text);
                        }
                    }
                    _ => {}
                }
            }
            out
        }
        _ => String::new(),
    }
}

/// Renders a unary [`ChatResponse`] as a Responses-dialect response object.
pub fn chat_response_to_responses_body(response: &ChatResponse) -> Value {
    let text = response.text();
    let finish = response
        .choices
        .first()
        .and_then(|choice| choice.finish_reason.as_deref())
        .unwrap_or("stop");
    let (status, incomplete) = match finish {
        "length" => ("incomplete", Some(json!({ "reason": "max_output_tokens" }))),
        "content_filter" => ("incomplete", Some(json!({ "reason": "content_filter" }))),
        _ => ("completed", None),
    };

    let mut output = Vec::new();
    if !text.is_empty() {
        output.push(json!({
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "output_text", "text": text }],
        }));
    }
    if let Some(calls) = response
        .choices
        .first()
        .and_then(|choice| choice.message.tool_calls.as_ref())
        .and_then(Value::as_array)
    {
        for (slot, call) in calls.iter().enumerate() {
            let function = call.get("function");
            let Some(name) = function
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
            else {
                continue;
            };
            let call_id = call
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{slot}"));
            let arguments = function
                .and_then(|f| f.get("arguments"))
                .and_then(Value::as_str)
                .filter(|arguments| !arguments.trim().is_empty())
                .unwrap_or("{}");
            output.push(json!({
                "type": "function_call",
                "call_id": call_id,
                "name": name,
                "arguments": arguments,
            }));
        }
    }

    let mut out = Map::new();
    out.insert("id".to_string(), Value::String(response.id.clone()));
    out.insert("object".to_string(), Value::String("response".to_string()));
    out.insert("status".to_string(), Value::String(status.to_string()));
    out.insert("model".to_string(), Value::String(response.model.clone()));
    out.insert("output".to_string(), Value::Array(output));
    out.insert("output_text".to_string(), Value::String(text));
    if let Some(incomplete) = incomplete {
        out.insert("incomplete_details".to_string(), incomplete);
    }
    out.insert(
        "usage".to_string(),
        json!({
            "input_tokens": response.usage.prompt_tokens,
            "output_tokens": response.usage.completion_tokens,
            "total_tokens": response.usage.total_tokens,
        }),
    );
    Value::Object(out)
}

/// Builds a Responses-dialect create body from a chat request destined for a
/// provider that only speaks Responses.
pub fn chat_request_to_responses_body(body: &Value) -> Option<Value> {
    let obj = body.as_object()?;
    let mut out = Map::new();
    out.insert("model".to_string(), obj.get("model")?.clone());
    for (from, to) in [
        ("temperature", "temperature"),
        ("top_p", "top_p"),
        ("max_tokens", "max_output_tokens"),
        ("tools", "tools"),
        ("tool_choice", "tool_choice"),
    ] {
        if let Some(value) = obj.get(from) {
            out.insert(to.to_string(), value.clone());
        }
    }
    if obj.get("stream").and_then(Value::as_bool).unwrap_or(false) {
        out.insert("stream".to_string(), Value::Bool(true));
    }

    let mut input = Vec::new();
    for message in obj.get("messages").and_then(Value::as_array)?.iter() {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let content = flatten_content(message.get("content"));
        if role == "system" {
            out.insert("instructions".to_string(), Value::String(content));
            continue;
        }
        input.push(json!({ "role": role, "content": content }));
    }
    out.insert("input".to_string(), Value::Array(input));
    Some(Value::Object(out))
}

/// Decodes a unary Responses-dialect response into the gateway's canonical
/// [`ChatResponse`].
pub fn responses_response_to_chat(raw: &Value, created: u64) -> Option<ChatResponse> {
    let obj = raw.as_object()?;
    let id = obj.get("id").and_then(Value::as_str)?.to_string();
    let model = obj
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for item in obj.get("output").and_then(Value::as_array).into_iter().flatten() {
        match item.get("type").and_then(Value::as_str) {
            Some("message") => {
                for part in item.get("content").and_then(Value::as_array).into_iter().flatten() {
                    if let Some(part_text) = part.get("text").and_then(Value::as_str) {
                        text.push_str(part_text);
                    }
                }
            }
            Some("function_call") => {
                tool_calls.push(json!({
                    "id": item.get("call_id").cloned().unwrap_or(Value::Null),
                    "type": "function",
                    "function": {
                        "name": item.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": item.get("arguments").cloned().unwrap_or(json!("{}")),
                    }
                }));
            }
            _ => {}
        }
    }

    let usage = obj
        .get("usage")
        .map(responses_usage_to_usage)
        .unwrap_or_default();
    let finish_reason = match obj.get("status").and_then(Value::as_str) {
        Some("incomplete") => "length",
        _ if !tool_calls.is_empty() => "tool_calls",
        _ => "stop",
    };

    let message = ChatMessage {
        role: "assistant".to_string(),
        content: Value::String(text),
        name: None,
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(Value::Array(tool_calls))
        },
        tool_call_id: None,
    };

    Some(ChatResponse {
        id,
        object: "chat.completion".to_string(),
        created,
        model,
        choices: vec![ChatChoice {
            index: 0,
            message,
            finish_reason: Some(finish_reason.to_string()),
            logprobs: None,
        }],
        usage,
        raw_response: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_chat_chunk_splits_content_first_usage_last() {
        let raw = json!({
            "id": "chunk-1",
            "object": "chat.completion.chunk",
            "choices": [{ "index": 0, "delta": { "content": "tail" } }],
            "usage": { "prompt_tokens": 3, "completion_tokens": 9, "total_tokens": 12 },
        });
        let events = decode_chat_chunk(&raw);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::ContentDelta { text } if text == "tail"));
        assert!(matches!(&events[1], StreamEvent::Usage(usage) if usage.total_tokens == 12));
    }

    #[test]
    fn responses_renderer_keeps_content_before_usage_for_combined_chunk() {
        let mut renderer = ResponsesEventRenderer::new("resp-1");
        let raw = json!({
            "choices": [{ "index": 0, "delta": { "content": "x" } }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2 },
        });

        let mut frames = Vec::new();
        for event in decode_chat_chunk(&raw) {
            frames.extend(renderer.render(&event));
        }
        frames.extend(renderer.render(&StreamEvent::Done));

        let types: Vec<&str> = frames
            .iter()
            .map(|frame| frame.get("type").and_then(Value::as_str).unwrap())
            .collect();
        assert_eq!(
            types,
            ["response.created", "response.output_text.delta", "response.completed"]
        );
        let completed = frames.last().unwrap();
        assert_eq!(
            completed.pointer("/response/usage/total_tokens"),
            Some(&json!(2))
        );
    }

    #[test]
    fn chat_renderer_announces_role_once_and_ends_with_usage() {
        let mut renderer = ChatChunkRenderer::new("id-1", "gpt-4o", 99);
        let first = renderer.render(&StreamEvent::ContentDelta {
            text: "a".to_string(),
        });
        let second = renderer.render(&StreamEvent::ContentDelta {
            text: "b".to_string(),
        });
        renderer.render(&StreamEvent::Usage(Usage {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
        }));
        let terminal = renderer.render(&StreamEvent::Done);

        assert_eq!(
            first[0].pointer("/choices/0/delta/role"),
            Some(&json!("assistant"))
        );
        assert_eq!(second[0].pointer("/choices/0/delta/role"), None);
        assert_eq!(terminal.len(), 2);
        assert_eq!(
            terminal[0].pointer("/choices/0/finish_reason"),
            Some(&json!("stop"))
        );
        assert_eq!(terminal[1].pointer("/usage/total_tokens"), Some(&json!(3)));
        assert_eq!(terminal[1]["choices"], json!([]));
    }

    #[test]
    fn responses_stream_decodes_deltas_and_completed_usage() {
        let delta = json!({ "type": "response.output_text.delta", "delta": "Hello" });
        assert_eq!(
            decode_responses_event(&delta),
            vec![StreamEvent::ContentDelta {
                text: "Hello".to_string()
            }]
        );

        let completed = json!({
            "type": "response.completed",
            "response": { "id": "resp-9", "usage": { "input_tokens": 1, "output_tokens": 2, "total_tokens": 3 } }
        });
        let events = decode_responses_event(&completed);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::Usage(usage) if usage.total_tokens == 3));
        assert_eq!(events[1], StreamEvent::Done);
    }

    #[test]
    fn responses_request_maps_instructions_and_input() {
        let request = json!({
            "model": "gpt-4o",
            "instructions": "be terse",
            "input": [
                { "role": "user", "content": [{ "type": "input_text", "text": "hi" }] },
            ],
            "max_output_tokens": 64,
        });
        let body = responses_request_to_chat_body(&request).unwrap();
        assert_eq!(body["max_tokens"], json!(64));
        assert_eq!(body["messages"][0]["role"], json!("system"));
        assert_eq!(body["messages"][1]["content"], json!("hi"));
    }

    #[test]
    fn unary_chat_response_round_trips_through_responses_shape() {
        let response = ChatResponse::assistant_text(
            "resp-1",
            "gpt-4o",
            7,
            "hello there",
            Usage {
                prompt_tokens: 2,
                completion_tokens: 3,
                total_tokens: 5,
            },
        );
        let rendered = chat_response_to_responses_body(&response);
        assert_eq!(rendered["status"], json!("completed"));
        assert_eq!(rendered["output_text"], json!("hello there"));
        assert_eq!(rendered["usage"]["total_tokens"], json!(5));

        let back = responses_response_to_chat(&rendered, 7).unwrap();
        assert_eq!(back.text(), "hello there");
        assert_eq!(back.usage.total_tokens, 5);
    }

    #[test]
    fn chat_request_to_responses_moves_system_to_instructions() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                { "role": "system", "content": "You are brief." },
                { "role": "user", "content": "hi" },
            ],
            "max_tokens": 32,
        });
        let out = chat_request_to_responses_body(&body).unwrap();
        assert_eq!(out["instructions"], json!("You are brief."));
        assert_eq!(out["max_output_tokens"], json!(32));
        assert_eq!(out["input"][0]["content"], json!("hi"));
    }
}
