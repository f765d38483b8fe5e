//! Server-Sent Events framing: a small incremental parser for the
//! `data: <json>\n\n` / terminal `data: [DONE]\n\n` framing OpenAI-dialect
//! services use, an encoder for re-emitting chunks to the client in that
//! same framing, and (re-exported) the AWS EventStream binary decoder the
//! teacher already built for Bedrock's `invoke-with-response-stream`,
//! which has nothing to do with text SSE but shares the same "decode one
//! upstream framing, produce one text SSE frame per message" role in the
//! response handler.

use bytes::{Buf, Bytes, BytesMut};

pub use aws_smithy_eventstream::frame::DecodedFrame;
use aws_smithy_eventstream::frame::MessageFrameDecoder;
pub use aws_smithy_types::event_stream::Message as AwsEventStreamMessage;
use tokio_util::codec::Decoder;

pub const DONE: &str = "[DONE]";

/// Incrementally parses a byte stream in SSE framing, yielding complete
/// `data:` payloads as they appear. Lines are terminated by `\n` or
/// `\r\n`; an event ends at a blank line. Fields other than `data` (e.g.
/// `event:`, `id:`) are accepted but ignored, since no upstream this proxy
/// talks to uses them for anything the response handler needs.
#[derive(Default)]
pub struct SseParser {
	buffer: BytesMut,
}

impl SseParser {
	pub fn new() -> Self {
		SseParser::default()
	}

	pub fn push(&mut self, chunk: &[u8]) {
		self.buffer.extend_from_slice(chunk);
	}

	/// Pops the next complete `data:` payload out of the buffer, if one is
	/// available. Returns `None` when the buffer holds only a partial
	/// event; call `push` again with more bytes and retry.
	pub fn next_event(&mut self) -> Option<String> {
		loop {
			let boundary = find_event_boundary(&self.buffer)?;
			let event_bytes = self.buffer.split_to(boundary.event_len);
			self.buffer.advance(boundary.consume_extra);
			let mut data = String::new();
			for line in event_bytes.split(|&b| b == b'\n') {
				let line = strip_cr(line);
				if let Some(rest) = line.strip_prefix(b"data:") {
					let rest = rest.strip_prefix(b" ").unwrap_or(rest);
					if !data.is_empty() {
						data.push('\n');
					}
					data.push_str(&String::from_utf8_lossy(rest));
				}
			}
			if data.is_empty() {
				// A blank/comment-only event (e.g. a bare keep-alive
				// `: ping\n\n`); skip it and look for the next one.
				continue;
			}
			return Some(data);
		}
	}
}

struct Boundary {
	event_len: usize,
	consume_extra: usize,
}

fn find_event_boundary(buf: &BytesMut) -> Option<Boundary> {
	let bytes = buf.as_ref();
	let mut i = 0;
	while i + 1 < bytes.len() {
		if bytes[i] == b'\n' && bytes[i + 1] == b'\n' {
			return Some(Boundary { event_len: i, consume_extra: 2 });
		}
		if i + 3 < bytes.len() && &bytes[i..i + 4] == b"\r\n\r\n" {
			return Some(Boundary { event_len: i, consume_extra: 4 });
		}
		i += 1;
	}
	None
}

fn strip_cr(line: &[u8]) -> &[u8] {
	if line.last() == Some(&b'\r') { &line[..line.len() - 1] } else { line }
}

pub fn encode_event(data: &str) -> Bytes {
	let mut out = String::with_capacity(data.len() + 8);
	for line in data.split('\n') {
		out.push_str("data: ");
		out.push_str(line);
		out.push('\n');
	}
	out.push('\n');
	Bytes::from(out.into_bytes())
}

pub fn encode_done() -> Bytes {
	encode_event(DONE)
}

/// §6: "synthetic error events embed a fenced-code block `[<type>
/// (<status>)]: <json>` to surface errors mid-stream" — used once a
/// streaming response has already committed its headers, so a terminal
/// failure can no longer become a normal HTTP error status and must be
/// folded into the chat-completion delta shape the client is already
/// reading.
pub fn framed_error_event(kind: &str, status: u16, detail: &str) -> Bytes {
	let detail_json = serde_json::json!({ "status": status, "message": detail });
	let fenced = std::format!("\n```\n[{kind} ({status})]: {detail_json}\n```\n");
	let chunk = serde_json::json!({
		"object": "chat.completion.chunk",
		"choices": [{ "index": 0, "delta": { "content": fenced }, "finish_reason": "stop" }],
	});
	encode_event(&chunk.to_string())
}

/// A `tokio_util::codec::Decoder` over AWS's binary EventStream framing,
/// used for Bedrock's `invoke-with-response-stream` endpoint, which speaks
/// neither plain chunked JSON nor text SSE.
#[derive(Debug)]
pub enum AwsEventStreamError {
	Protocol(aws_smithy_eventstream::error::Error),
	Io(std::io::Error),
}

impl std::fmt::Display for AwsEventStreamError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Protocol(e) => write!(f, "{e}"),
			Self::Io(e) => write!(f, "{e}"),
		}
	}
}

impl std::error::Error for AwsEventStreamError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Self::Protocol(e) => Some(e),
			Self::Io(e) => Some(e),
		}
	}
}

impl From<std::io::Error> for AwsEventStreamError {
	fn from(err: std::io::Error) -> Self {
		Self::Io(err)
	}
}

impl From<aws_smithy_eventstream::error::Error> for AwsEventStreamError {
	fn from(err: aws_smithy_eventstream::error::Error) -> Self {
		Self::Protocol(err)
	}
}

#[derive(Default)]
pub struct AwsEventStreamCodec {
	inner: MessageFrameDecoder,
}

impl AwsEventStreamCodec {
	pub fn new() -> Self {
		Self::default()
	}
}

impl Decoder for AwsEventStreamCodec {
	type Item = AwsEventStreamMessage;
	type Error = AwsEventStreamError;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.inner.decode_frame(src)? {
			DecodedFrame::Complete(message) => Ok(Some(message)),
			DecodedFrame::Incomplete => Ok(None),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_single_event() {
		let mut parser = SseParser::new();
		parser.push(b"data: {\"a\":1}\n\n");
		assert_eq!(parser.next_event().as_deref(), Some(r#"{"a":1}"#));
		assert_eq!(parser.next_event(), None);
	}

	#[test]
	fn parses_event_split_across_pushes() {
		let mut parser = SseParser::new();
		parser.push(b"data: {\"a\":");
		assert_eq!(parser.next_event(), None);
		parser.push(b"1}\n\n");
		assert_eq!(parser.next_event().as_deref(), Some(r#"{"a":1}"#));
	}

	#[test]
	fn parses_multiline_data_field() {
		let mut parser = SseParser::new();
		parser.push(b"data: line one\ndata: line two\n\n");
		assert_eq!(parser.next_event().as_deref(), Some("line one\nline two"));
	}

	#[test]
	fn skips_comment_only_events() {
		let mut parser = SseParser::new();
		parser.push(b": keep-alive\n\ndata: real\n\n");
		assert_eq!(parser.next_event().as_deref(), Some("real"));
	}

	#[test]
	fn encodes_done_marker() {
		assert_eq!(encode_done(), Bytes::from_static(b"data: [DONE]\n\n"));
	}

	#[test]
	fn framed_error_event_embeds_type_and_status_in_a_fenced_block() {
		let event = framed_error_event("proxy_rate_limited", 429, "upstream rate limited");
		let text = String::from_utf8(event.to_vec()).unwrap();
		assert!(text.starts_with("data: "));
		assert!(text.contains("[proxy_rate_limited (429)]"));
		assert!(text.contains("upstream rate limited"));
		assert!(text.ends_with("\n\n"));
	}
}
