use serde_json::{Value, json};

use crate::error::{ProxyError, ProxyResult};
use crate::key::Usage;
use crate::model::LLMService;

/// Translates a non-streaming upstream response body into the OpenAI
/// chat-completions response shape every client of this proxy expects,
/// regardless of which service actually served the request.
pub fn translate_response(service: LLMService, body: &Value) -> ProxyResult<Value> {
	match service {
		LLMService::OpenAI | LLMService::AzureOpenAI => Ok(body.clone()),
		LLMService::Anthropic | LLMService::AwsBedrock => from_anthropic_messages(body),
		LLMService::GoogleAI => from_google_ai(body),
		LLMService::Mistral => Ok(body.clone()),
	}
}

/// §4.6: multi-part Anthropic chat content arrays are flattened by
/// concatenating `text` parts with `\n`; non-text parts (tool use, images)
/// aren't representable in the OpenAI `message.content` string, so each is
/// replaced with a `[<type>]` marker rather than silently dropped.
fn flatten_anthropic_content(blocks: &[Value]) -> Option<String> {
	if blocks.is_empty() {
		return None;
	}
	let parts: Vec<String> = blocks
		.iter()
		.map(|block| match block["text"].as_str() {
			Some(text) => text.to_string(),
			None => {
				let kind = block["type"].as_str().unwrap_or("unknown");
				format!("[{kind}]")
			},
		})
		.collect();
	Some(parts.join("\n"))
}

fn from_anthropic_messages(body: &Value) -> ProxyResult<Value> {
	let text = body["content"]
		.as_array()
		.and_then(|blocks| flatten_anthropic_content(blocks))
		.ok_or_else(|| ProxyError::Upstream { status: 502, body: "missing content block in Anthropic response".to_string() })?;
	let text = text.trim_end();
	let finish_reason = match body["stop_reason"].as_str() {
		Some("max_tokens") => "length",
		Some("stop_sequence") | Some("end_turn") => "stop",
		_ => "stop",
	};
	Ok(json!({
		"id": body["id"],
		"object": "chat.completion",
		"model": body["model"],
		"choices": [{
			"index": 0,
			"message": { "role": "assistant", "content": text },
			"finish_reason": finish_reason,
		}],
		"usage": {
			"prompt_tokens": body["usage"]["input_tokens"],
			"completion_tokens": body["usage"]["output_tokens"],
			"total_tokens": body["usage"]["input_tokens"].as_u64().unwrap_or(0)
				+ body["usage"]["output_tokens"].as_u64().unwrap_or(0),
		},
	}))
}

fn from_google_ai(body: &Value) -> ProxyResult<Value> {
	let text = body["candidates"]
		.as_array()
		.and_then(|c| c.first())
		.and_then(|c| c["content"]["parts"].as_array())
		.and_then(|parts| parts.first())
		.and_then(|p| p["text"].as_str())
		.ok_or_else(|| ProxyError::Upstream { status: 502, body: "missing candidate text in Google AI response".to_string() })?;
	let prompt_tokens = body["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0);
	let completion_tokens = body["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0);
	Ok(json!({
		"object": "chat.completion",
		"choices": [{
			"index": 0,
			"message": { "role": "assistant", "content": text },
			"finish_reason": "stop",
		}],
		"usage": {
			"prompt_tokens": prompt_tokens,
			"completion_tokens": completion_tokens,
			"total_tokens": prompt_tokens + completion_tokens,
		},
	}))
}

pub fn extract_usage(service: LLMService, body: &Value) -> Usage {
	let (prompt, completion) = match service {
		LLMService::OpenAI | LLMService::AzureOpenAI | LLMService::Mistral => (
			body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
			body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
		),
		LLMService::Anthropic | LLMService::AwsBedrock => (
			body["usage"]["input_tokens"].as_u64().unwrap_or(0),
			body["usage"]["output_tokens"].as_u64().unwrap_or(0),
		),
		LLMService::GoogleAI => (
			body["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
			body["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0),
		),
	};
	Usage { prompt_tokens: prompt, completion_tokens: completion, cost_usd_micros: 0 }
}
