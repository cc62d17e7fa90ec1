//! Bounded server-sent-events decoding. Upstream streams are untrusted, so
//! both the line length and the assembled event size are capped — the line
//! cap is enforced while reading, never after buffering a whole line.

use futures_util::TryStreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;

use crate::Result;
use crate::error::GatewayError;

#[derive(Clone, Copy, Debug)]
pub struct SseLimits {
    pub max_line_bytes: usize,
    pub max_event_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Reads one line into `out`, checking the cap before each extension so a
/// newline-less flood never buffers past `max_bytes`. Returns false at EOF
/// with nothing read.
async fn read_line_limited<R>(reader: &mut R, out: &mut Vec<u8>, max_bytes: usize) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    if max_bytes == 0 {
        return Err(GatewayError::InvalidResponse(
            "max_line_bytes must be > 0".to_string(),
        ));
    }

    out.clear();

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(!out.is_empty());
        }

        let newline_pos = buf.iter().position(|b| *b == b'\n');
        let take_len = newline_pos.map(|pos| pos + 1).unwrap_or(buf.len());

        if out.len().saturating_add(take_len) > max_bytes {
            return Err(GatewayError::InvalidResponse(format!(
                "SSE line exceeds max_line_bytes={max_bytes}"
            )));
        }

        out.extend_from_slice(&buf[..take_len]);
        reader.consume(take_len);

        if newline_pos.is_some() {
            return Ok(true);
        }
    }
}

/// Reads SSE frames and yields the concatenated `data:` payload of each event.
/// The `[DONE]` sentinel ends the stream without being yielded.
async fn next_sse_data<R>(
    reader: &mut R,
    line_bytes: &mut Vec<u8>,
    buffer: &mut String,
    limits: SseLimits,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    if limits.max_event_bytes == 0 {
        return Err(GatewayError::InvalidResponse(
            "max_event_bytes must be > 0".to_string(),
        ));
    }

    buffer.clear();

    loop {
        let has_line = read_line_limited(reader, line_bytes, limits.max_line_bytes).await?;
        if !has_line {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(buffer)));
        }

        let line = std::str::from_utf8(line_bytes).map_err(|err| {
            GatewayError::InvalidResponse(format!("invalid SSE UTF-8: {err}"))
        })?;
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            if buffer.is_empty() {
                continue;
            }
            if buffer == "[DONE]" {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(buffer)));
        }

        let Some(rest) = line.strip_prefix("data:") else {
            continue;
        };
        let rest = rest.trim_start();

        let separator = usize::from(!buffer.is_empty());
        if buffer.len().saturating_add(separator).saturating_add(rest.len())
            > limits.max_event_bytes
        {
            return Err(GatewayError::InvalidResponse(format!(
                "SSE event exceeds max_event_bytes={}",
                limits.max_event_bytes
            )));
        }
        if separator == 1 {
            buffer.push('\n');
        }
        buffer.push_str(rest);
    }
}

pub fn sse_data_stream_from_reader<R>(reader: R, limits: SseLimits) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        (reader, Vec::<u8>::new(), String::new(), limits),
        |(mut reader, mut line_bytes, mut buffer, limits)| async move {
            match next_sse_data(&mut reader, &mut line_bytes, &mut buffer, limits).await? {
                Some(data) => Ok(Some((data, (reader, line_bytes, buffer, limits)))),
                None => Ok(None),
            }
        },
    ))
}

pub fn sse_data_stream_from_response(
    response: reqwest::Response,
) -> BoxStream<'static, Result<String>> {
    let byte_stream = response.bytes_stream().map_err(std::io::Error::other);
    let reader = StreamReader::new(byte_stream);
    sse_data_stream_from_reader(BufReader::new(reader), SseLimits::default())
}
