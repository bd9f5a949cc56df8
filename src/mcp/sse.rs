//! Decoder for the backend's server-sent event framing.
//!
//! Responses to held-open POSTs arrive as repeated `data: <JSON>` blocks
//! separated by a blank line. [`frames`] turns a byte stream into a lazy
//! sequence of parsed JSON values; [`await_response`] consumes frames until
//! the one answering a given request id.

use futures::{Stream, StreamExt, pin_mut};
use serde_json::Value;
use tracing::warn;

use crate::error::BridgeError;

/// Decode an SSE-framed byte stream into a lazy sequence of JSON values.
///
/// Frames whose payload is not valid JSON are skipped with a warning; a
/// malformed frame is never fatal to the stream. Transport errors end the
/// stream after a warning, mirroring how an upstream disconnect looks to
/// the caller.
pub fn frames<S, B, E>(byte_stream: S) -> impl Stream<Item = Value>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    async_stream::stream! {
        let mut buf = Vec::<u8>::new();
        pin_mut!(byte_stream);

        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    warn!(name: "mcp.stream.transport_error", error = %e, "event stream interrupted");
                    break;
                }
            };
            buf.extend_from_slice(chunk.as_ref());

            while let Some((pos, sep_len)) = find_frame_boundary(&buf) {
                let frame: Vec<u8> = buf.drain(..pos + sep_len).collect();
                for value in decode_frame(&frame) {
                    yield value;
                }
            }
        }

        // A final frame may arrive without its trailing blank line.
        if !buf.is_empty() {
            for value in decode_frame(&buf) {
                yield value;
            }
        }
    }
}

/// Consume frames until one whose `id` matches `expected_id`, then stop.
///
/// This models the upstream's per-call pattern: a POST holds the connection
/// open and emits exactly one matching frame, after which the caller should
/// stop reading. Stream end without a match is an error.
pub async fn await_response<S>(frame_stream: S, expected_id: u64) -> Result<Value, BridgeError>
where
    S: Stream<Item = Value>,
{
    pin_mut!(frame_stream);
    while let Some(frame) = frame_stream.next().await {
        if frame_matches_id(&frame, expected_id) {
            return Ok(frame);
        }
        warn!(
            name: "mcp.stream.unmatched_frame",
            expected_id = expected_id,
            frame_id = %frame.get("id").cloned().unwrap_or(serde_json::Value::Null),
            "skipping frame for a different request id"
        );
    }
    Err(BridgeError::Rpc(format!(
        "stream closed before a response to request {expected_id}"
    )))
}

/// Request ids are integers on our side, but the upstream may echo them
/// back as either a number or a string.
fn frame_matches_id(frame: &Value, expected_id: u64) -> bool {
    match frame.get("id") {
        Some(Value::Number(n)) => n.as_u64() == Some(expected_id),
        Some(Value::String(s)) => s == &expected_id.to_string(),
        _ => false,
    }
}

/// Find the end of the next frame: a blank line, in either newline
/// convention. Returns (offset, separator length).
fn find_frame_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 < b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn decode_frame(frame: &[u8]) -> Vec<Value> {
    let text = String::from_utf8_lossy(frame);
    let mut out = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() {
            continue;
        }

        match serde_json::from_str::<Value>(data) {
            Ok(value) => out.push(value),
            Err(e) => {
                warn!(
                    name: "mcp.stream.malformed_frame",
                    error = %e,
                    payload = %data.chars().take(120).collect::<String>(),
                    "skipping undecodable frame"
                );
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::convert::Infallible;

    fn byte_stream(chunks: Vec<&'static str>) -> impl Stream<Item = Result<&'static [u8], Infallible>> {
        stream::iter(chunks.into_iter().map(|c| Ok(c.as_bytes())))
    }

    #[tokio::test]
    async fn decodes_consecutive_frames() {
        let input = byte_stream(vec![
            "data: {\"id\": 1, \"result\": {}}\n\n",
            "data: {\"id\": 2, \"result\": {\"ok\": true}}\n\n",
        ]);
        let decoded: Vec<Value> = frames(input).collect().await;
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0]["id"], 1);
        assert_eq!(decoded[1]["result"]["ok"], true);
    }

    #[tokio::test]
    async fn reassembles_frames_split_across_chunks() {
        let input = byte_stream(vec!["data: {\"id\"", ": 5, \"result\": {}}", "\n\n"]);
        let decoded: Vec<Value> = frames(input).collect().await;
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0]["id"], 5);
    }

    #[tokio::test]
    async fn skips_malformed_frames_and_continues() {
        let input = byte_stream(vec![
            "data: this is not json\n\n",
            "data: {\"id\": 9, \"result\": {}}\n\n",
        ]);
        let decoded: Vec<Value> = frames(input).collect().await;
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0]["id"], 9);
    }

    #[tokio::test]
    async fn ignores_non_data_lines() {
        let input = byte_stream(vec![
            "event: message\r\nid: 3\r\ndata: {\"id\": 3, \"result\": {}}\r\n\r\n",
        ]);
        let decoded: Vec<Value> = frames(input).collect().await;
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0]["id"], 3);
    }

    #[tokio::test]
    async fn decodes_final_frame_without_trailing_blank_line() {
        let input = byte_stream(vec!["data: {\"id\": 4, \"result\": {}}"]);
        let decoded: Vec<Value> = frames(input).collect().await;
        assert_eq!(decoded.len(), 1);
    }

    #[tokio::test]
    async fn await_response_returns_matching_frame() {
        let input = byte_stream(vec![
            "data: {\"id\": 1, \"result\": {\"n\": 1}}\n\n",
            "data: {\"id\": 2, \"result\": {\"n\": 2}}\n\n",
        ]);
        let frame = await_response(frames(input), 2).await.unwrap();
        assert_eq!(frame["result"]["n"], 2);
    }

    #[tokio::test]
    async fn await_response_matches_string_ids() {
        let input = byte_stream(vec!["data: {\"id\": \"7\", \"result\": {}}\n\n"]);
        let frame = await_response(frames(input), 7).await.unwrap();
        assert_eq!(frame["id"], "7");
    }

    #[tokio::test]
    async fn await_response_errors_when_stream_closes_unmatched() {
        let input = byte_stream(vec!["data: {\"id\": 1, \"result\": {}}\n\n"]);
        let err = await_response(frames(input), 99).await.unwrap_err();
        assert!(matches!(err, BridgeError::Rpc(_)));
    }
}
