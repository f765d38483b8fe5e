//! The response handler (§4.6): classifies the upstream's HTTP status into
//! one of a fixed set of outcomes, forwards or translates the body back
//! to the client's dialect, and feeds usage/rate-limit information back
//! into the key pool.

pub mod compression;

use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use once_cell::sync::Lazy;
use regex::Regex;
use relay_core::Strng;
use serde_json::Value;

use crate::error::{ProxyError, ProxyResult};
use crate::key::Usage;
use crate::key_pool::{KeyHandle, KeyPool};
use crate::model::{LLMService, ModelFamily};
use crate::sse::SseParser;
use crate::transform;

/// What the queue/dispatcher should do next, derived from an upstream
/// response's status line (and, for the 4xx cases the §4.6
/// `handleUpstreamErrors` table distinguishes by error body, the parsed
/// JSON body). This is the single classification point referenced by
/// DESIGN.md's grounding ledger for §4.6 and §7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
	Success,
	/// The key itself is bad and should never be selected again until a
	/// manual recheck clears it — 401s, AWS's
	/// `UnrecognizedClientException`/`AccessDeniedException`, and OpenAI's
	/// `access_terminated` 429 all land here.
	Disable { reason: &'static str },
	/// The key is rate-limited, possibly only for this family; apply the
	/// given backoff and requeue.
	RateLimited { retry_after: Duration, family: Option<ModelFamily> },
	/// The legacy Anthropic text-completion dialect rejected the prompt
	/// for missing the `\n\nHuman:` framing; a single retry with the
	/// preamble injected is expected to succeed (§4.6, bounded to one
	/// retry per DESIGN.md's Open Question decision).
	RequiresPreamble,
	/// Upstream had a transient problem; requeue with no key-pool side
	/// effects.
	RetryableUpstream,
	/// The client's request itself is invalid, or the model genuinely
	/// doesn't exist (`model_not_found`); fail it back without touching
	/// the key, which may still be perfectly usable for other families.
	ClientError,
}

/// `body` is the parsed JSON error envelope, when the response had one;
/// callers only need to decode it for non-2xx statuses, since the 4xx/5xx
/// distinctions below are the only ones classify cares about the body for.
pub fn classify(status: u16, headers: &reqwest::header::HeaderMap, family: ModelFamily, body: Option<&Value>) -> Outcome {
	let error_code = body.and_then(|b| b["error"]["code"].as_str().or_else(|| b["error"]["type"].as_str()));
	let error_message = body.and_then(|b| b["error"]["message"].as_str()).unwrap_or("");
	let aws_exception_type = body.and_then(|b| b["__type"].as_str());

	match status {
		200..=299 => Outcome::Success,
		400 => {
			if family.service() == LLMService::Anthropic && error_message.contains("Human:") {
				Outcome::RequiresPreamble
			} else {
				Outcome::ClientError
			}
		},
		401 => Outcome::Disable { reason: "rejected by upstream with 401" },
		403 => match aws_exception_type {
			Some("UnrecognizedClientException") | Some("AccessDeniedException") => {
				Outcome::Disable { reason: "revoked (AWS rejected the credential)" }
			},
			_ => Outcome::Disable { reason: "rejected by upstream with 403" },
		},
		404 => Outcome::ClientError,
		422 => Outcome::ClientError,
		429 => {
			let retry_after = headers
				.get(reqwest::header::RETRY_AFTER)
				.and_then(|v| v.to_str().ok())
				.and_then(|v| v.parse::<u64>().ok())
				.map(Duration::from_secs)
				.unwrap_or(Duration::from_secs(20));
			match error_code {
				Some("insufficient_quota") | Some("billing_not_active") => Outcome::Disable { reason: "quota exhausted" },
				Some("access_terminated") => Outcome::Disable { reason: "revoked (access terminated)" },
				_ => Outcome::RateLimited { retry_after, family: Some(family) },
			}
		},
		500..=599 => Outcome::RetryableUpstream,
		_ => Outcome::RetryableUpstream,
	}
}

pub fn apply_outcome(pool: &KeyPool, handle: &KeyHandle, outcome: &Outcome) {
	match outcome {
		Outcome::Disable { reason } => pool.disable(handle, *reason),
		Outcome::RateLimited { retry_after, family } => pool.mark_rate_limited(handle, *retry_after, *family),
		Outcome::Success | Outcome::RetryableUpstream | Outcome::ClientError | Outcome::RequiresPreamble => {},
	}
}

static ORG_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"org-[A-Za-z0-9]+").unwrap());
const ORG_ID_PLACEHOLDER: &str = "org-xxxxxxxxxxxxxxxxxxx";

/// Masks OpenAI organization ids (`org-…` → `org-xxxxxxxxxxxxxxxxxxx`)
/// wherever they appear in the response body, not just in known fields —
/// an id can show up inside a free-text error message just as easily as
/// in a dedicated `organization` field, so every string leaf of the body
/// is scanned rather than a fixed set of keys being deleted.
pub fn scrub_organization_id(body: Value) -> Value {
	match body {
		Value::String(s) => Value::String(ORG_ID_PATTERN.replace_all(&s, ORG_ID_PLACEHOLDER).into_owned()),
		Value::Array(items) => Value::Array(items.into_iter().map(scrub_organization_id).collect()),
		Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, scrub_organization_id(v))).collect()),
		other => other,
	}
}

pub struct NonStreamingResult {
	pub body: Value,
	pub usage: Usage,
}

pub async fn handle_non_streaming(
	service: LLMService,
	status: u16,
	content_encoding: Option<&str>,
	raw_body: Bytes,
) -> ProxyResult<NonStreamingResult> {
	let decompressed = compression::decompress(raw_body, content_encoding)
		.await
		.map_err(|e| ProxyError::Upstream { status, body: e.to_string() })?;
	let body: Value = serde_json::from_slice(&decompressed)
		.map_err(|e| ProxyError::Upstream { status, body: format!("invalid JSON from upstream: {e}") })?;
	let usage = transform::response::extract_usage(service, &body);
	let translated = transform::response::translate_response(service, &body)?;
	Ok(NonStreamingResult { body: scrub_organization_id(translated), usage })
}

/// Forwards an upstream SSE stream to the client, reassembling only
/// enough of each event to extract running token usage as it's
/// recognized (the body chunks themselves are forwarded byte-for-byte so
/// the client gets the provider's native streaming dialect). If the
/// client disconnects partway through, whatever usage has accumulated so
/// far is what gets charged — see DESIGN.md's Open Question decision on
/// partial-stream accounting.
pub struct StreamAccumulator {
	parser: SseParser,
	pub usage: Usage,
	service: LLMService,
}

impl StreamAccumulator {
	pub fn new(service: LLMService) -> Self {
		StreamAccumulator { parser: SseParser::new(), usage: Usage::default(), service }
	}

	/// Feeds a raw chunk from upstream, returning it unchanged for
	/// forwarding to the client while also scanning it for usage data.
	pub fn observe(&mut self, chunk: &[u8]) -> &[u8] {
		self.parser.push(chunk);
		while let Some(event) = self.parser.next_event() {
			if event == crate::sse::DONE {
				continue;
			}
			if let Ok(value) = serde_json::from_str::<Value>(&event) {
				let usage = transform::response::extract_usage(self.service, &value);
				if usage.prompt_tokens > 0 || usage.completion_tokens > 0 {
					self.usage = usage;
				} else if let Some(delta) = value["choices"][0]["delta"]["content"].as_str() {
					// Providers that don't send a final usage block (older
					// OpenAI streaming responses) at least let us estimate
					// completion tokens from the deltas actually received.
					self.usage.completion_tokens += crate::tokenizer::count_text_tokens(ModelFamily::Gpt4, delta) as u64;
				}
			}
		}
		chunk
	}
}

/// Forwards `stream`, feeding every chunk through `accumulator`, and calls
/// `on_complete` with whatever usage it accumulated once the upstream side
/// of the stream ends. If the *client* disconnects first the generator is
/// simply dropped mid-poll and `on_complete` never runs — accounting for
/// that case (§9 Open Question: charge tokens actually received) happens
/// via the request's `onAborted` path instead, not here. `on_complete` is
/// where callers feed usage back into the user store and key pool (§4.3
/// `incrementUsage`, §4.4 step 8) after the response has actually been
/// served — unlike non-streaming requests, that can't happen until here.
pub fn stream_with_accumulator<S, E>(
	mut stream: S,
	mut accumulator: StreamAccumulator,
	on_complete: impl FnOnce(Usage) + Send + 'static,
) -> impl Stream<Item = Result<Bytes, E>>
where
	S: Stream<Item = Result<Bytes, E>> + Unpin,
{
	async_stream::stream! {
		use futures_util::StreamExt;
		while let Some(chunk) = stream.next().await {
			match chunk {
				Ok(bytes) => {
					accumulator.observe(&bytes);
					yield Ok(bytes);
				},
				Err(e) => yield Err(e),
			}
		}
		on_complete(accumulator.usage);
	}
}

pub fn service_label(service: LLMService) -> Strng {
	relay_core::literal!(service.as_str())
}

#[cfg(test)]
mod tests {
	use super::*;
	use reqwest::header::HeaderMap;

	#[test]
	fn classifies_success() {
		assert_eq!(classify(200, &HeaderMap::new(), ModelFamily::Gpt4, None), Outcome::Success);
	}

	#[test]
	fn classifies_401_as_disable() {
		assert_eq!(classify(401, &HeaderMap::new(), ModelFamily::Gpt4, None), Outcome::Disable { reason: "rejected by upstream with 401" });
	}

	#[test]
	fn classifies_aws_403_exception_types_as_disable() {
		let body = serde_json::json!({ "__type": "UnrecognizedClientException" });
		let outcome = classify(403, &HeaderMap::new(), ModelFamily::AwsClaude, Some(&body));
		assert_eq!(outcome, Outcome::Disable { reason: "revoked (AWS rejected the credential)" });
	}

	#[test]
	fn classifies_rate_limit_with_retry_after_header() {
		let mut headers = HeaderMap::new();
		headers.insert(reqwest::header::RETRY_AFTER, "45".parse().unwrap());
		let outcome = classify(429, &headers, ModelFamily::Gpt4, None);
		assert_eq!(outcome, Outcome::RateLimited { retry_after: Duration::from_secs(45), family: Some(ModelFamily::Gpt4) });
	}

	#[test]
	fn classifies_openai_quota_429_as_disable() {
		let body = serde_json::json!({ "error": { "code": "insufficient_quota", "message": "you exceeded your quota" } });
		let outcome = classify(429, &HeaderMap::new(), ModelFamily::Gpt4, Some(&body));
		assert_eq!(outcome, Outcome::Disable { reason: "quota exhausted" });
	}

	#[test]
	fn classifies_openai_access_terminated_429_as_disable() {
		let body = serde_json::json!({ "error": { "code": "access_terminated" } });
		let outcome = classify(429, &HeaderMap::new(), ModelFamily::Gpt4, Some(&body));
		assert_eq!(outcome, Outcome::Disable { reason: "revoked (access terminated)" });
	}

	#[test]
	fn classifies_5xx_as_retryable() {
		assert_eq!(classify(503, &HeaderMap::new(), ModelFamily::Gpt4, None), Outcome::RetryableUpstream);
	}

	#[test]
	fn classifies_400_as_client_error() {
		assert_eq!(classify(400, &HeaderMap::new(), ModelFamily::Gpt4, None), Outcome::ClientError);
	}

	#[test]
	fn classifies_model_not_found_404_as_client_error_without_touching_key() {
		let body = serde_json::json!({ "error": { "code": "model_not_found" } });
		assert_eq!(classify(404, &HeaderMap::new(), ModelFamily::Gpt4, Some(&body)), Outcome::ClientError);
	}

	#[test]
	fn classifies_anthropic_missing_preamble_400_as_requires_preamble() {
		let body = serde_json::json!({ "error": { "message": "prompt must start with \"\n\nHuman:\" turn" } });
		let outcome = classify(400, &HeaderMap::new(), ModelFamily::Claude, Some(&body));
		assert_eq!(outcome, Outcome::RequiresPreamble);
	}

	#[test]
	fn scrubs_organization_fields() {
		let body = serde_json::json!({ "organization": "org-AbCd1234EfGh", "choices": [] });
		let scrubbed = scrub_organization_id(body);
		assert_eq!(scrubbed["organization"], "org-xxxxxxxxxxxxxxxxxxx");
	}

	#[test]
	fn scrubs_an_organization_id_embedded_in_free_text() {
		let body = serde_json::json!({
			"error": { "message": "Your organization org-AbCd1234EfGh has been suspended" }
		});
		let scrubbed = scrub_organization_id(body);
		let message = scrubbed["error"]["message"].as_str().unwrap();
		assert!(!message.contains("org-AbCd1234EfGh"));
		assert!(message.contains("org-xxxxxxxxxxxxxxxxxxx"));
	}

	#[test]
	fn accumulator_tracks_usage_from_final_chunk() {
		let mut accumulator = StreamAccumulator::new(LLMService::OpenAI);
		accumulator.observe(b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n");
		accumulator.observe(b"data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n");
		assert_eq!(accumulator.usage.prompt_tokens, 5);
		assert_eq!(accumulator.usage.completion_tokens, 2);
	}
}
