use crate::error::{ProxyError, ProxyResult};
use crate::model::{APIFormat, LLMService};
use crate::schema::{anthropic, google_ai, mistral, openai};

#[cfg(test)]
#[path = "request_tests.rs"]
mod tests;

/// Translate a client's already-validated OpenAI-chat-shaped request into
/// whatever dialect the resolved upstream service needs. The client always
/// speaks `APIFormat::OpenAIChat` to this proxy (per spec.md's ingress
/// surface) — `incoming_format` is retained on the request context for
/// completeness and future dialect ingress, but every upstream translation
/// originates from the one normalized OpenAI-chat shape the pipeline
/// produces in its normalize stage.
pub fn translate_request(
	service: LLMService,
	request: &openai::ChatCompletionRequest,
) -> ProxyResult<serde_json::Value> {
	match service {
		LLMService::OpenAI | LLMService::AzureOpenAI => {
			serde_json::to_value(request).map_err(|e| ProxyError::Internal(e.to_string()))
		},
		LLMService::Mistral => to_mistral(request),
		LLMService::Anthropic | LLMService::AwsBedrock => to_anthropic_messages(request),
		LLMService::GoogleAI => to_google_ai(request),
	}
}

/// §4.2: "ensure first message may be system, then alternating
/// user/assistant ... coalesce consecutive same-role messages" — Mistral's
/// chat API rejects two consecutive turns of the same role, same as
/// Anthropic's Messages API.
fn to_mistral(request: &openai::ChatCompletionRequest) -> ProxyResult<serde_json::Value> {
	let mut messages: Vec<mistral::Message> = Vec::with_capacity(request.messages.len());
	for message in &request.messages {
		let text = message.content.text();
		match messages.last_mut() {
			Some(last) if last.role == message.role => {
				last.content.push_str("\n\n");
				last.content.push_str(&text);
			},
			_ => messages.push(mistral::Message { role: message.role.clone(), content: text }),
		}
	}
	let out = mistral::ChatRequest {
		model: request.model.clone(),
		messages,
		max_tokens: request.max_tokens,
		temperature: request.temperature,
		top_p: request.top_p,
		stream: request.stream,
		safe_prompt: None,
	};
	serde_json::to_value(out).map_err(|e| ProxyError::Internal(e.to_string()))
}

/// OpenAI puts the system prompt inline as a `system`-role message;
/// Anthropic's Messages API wants it pulled out into a dedicated `system`
/// field, with the remaining turns alternating user/assistant.
fn to_anthropic_messages(request: &openai::ChatCompletionRequest) -> ProxyResult<serde_json::Value> {
	let mut system = None;
	let mut messages: Vec<anthropic::Message> = Vec::with_capacity(request.messages.len());
	for message in &request.messages {
		if message.role == "system" && system.is_none() {
			system = Some(message.content.text());
			continue;
		}
		let text = message.content.text();
		// §4.2: "guarantee alternating turns" — the Messages API rejects
		// two consecutive turns of the same role, so adjacent same-role
		// messages are coalesced into one rather than sent as-is.
		match messages.last_mut() {
			Some(last) if last.role == message.role => {
				last.content.push_str("\n\n");
				last.content.push_str(&text);
			},
			_ => messages.push(anthropic::Message { role: message.role.clone(), content: text }),
		}
	}
	if messages.is_empty() {
		return Err(ProxyError::Validation("request has no user/assistant messages".to_string()));
	}
	if let Some(last) = messages.last_mut() {
		if last.role == "assistant" {
			last.content = last.content.trim_end().to_string();
		}
	}
	let out = anthropic::MessagesRequest {
		model: request.model.clone(),
		messages,
		max_tokens: request.max_tokens,
		system,
		temperature: request.temperature,
		stream: request.stream,
	};
	serde_json::to_value(out).map_err(|e| ProxyError::Internal(e.to_string()))
}

fn to_google_ai(request: &openai::ChatCompletionRequest) -> ProxyResult<serde_json::Value> {
	// §4.2: "collapse adjacent same-role messages, map assistant → model".
	let mut contents: Vec<google_ai::Content> = Vec::with_capacity(request.messages.len());
	for message in request.messages.iter().filter(|m| m.role != "system") {
		let role = if message.role == "assistant" { "model" } else { "user" }.to_string();
		let text = message.content.text();
		match contents.last_mut() {
			Some(last) if last.role == role => last.parts.push(google_ai::Part { text }),
			_ => contents.push(google_ai::Content { role, parts: vec![google_ai::Part { text }] }),
		}
	}
	let out = google_ai::GenerateContentRequest {
		contents,
		generation_config: google_ai::GenerationConfig {
			temperature: request.temperature,
			max_output_tokens: request.max_tokens,
			top_p: request.top_p,
			candidate_count: Some(1),
			stop_sequences: detect_character_name_stops(&request.messages),
		},
		safety_settings: google_ai::block_none_safety_settings(),
	};
	serde_json::to_value(out).map_err(|e| ProxyError::Internal(e.to_string()))
}

/// §4.2: "detect character-name prefixes in plain text and add them as
/// stop sequences (up to 5)" — roleplay-style clients format turns as
/// `Name: text`; without a matching stop sequence Google AI's model has
/// no signal to stop generating before writing the next character's line
/// itself.
fn detect_character_name_stops(messages: &[openai::Message]) -> Option<Vec<String>> {
	let mut seen = std::collections::HashSet::new();
	let mut stops = Vec::new();
	'outer: for message in messages {
		let text = message.content.text();
		for line in text.lines() {
			let Some((prefix, _)) = line.split_once(':') else { continue };
			let name = prefix.trim();
			if name.is_empty()
				|| name.len() > 32
				|| name.contains(char::is_whitespace)
				|| !name.chars().all(|c| c.is_alphanumeric() || c == '_')
				|| matches!(name.to_ascii_lowercase().as_str(), "system" | "user" | "assistant")
			{
				continue;
			}
			if seen.insert(name.to_string()) {
				stops.push(format!("{name}:"));
				if stops.len() >= 5 {
					break 'outer;
				}
			}
		}
	}
	if stops.is_empty() { None } else { Some(stops) }
}

/// Flattens an OpenAI chat request into the legacy Anthropic text-completion
/// prompt framing, injecting the required preamble if it's missing.
pub fn to_anthropic_text(request: &openai::ChatCompletionRequest, force_preamble: bool) -> ProxyResult<anthropic::TextCompletionRequest> {
	let mut prompt = String::new();
	for message in &request.messages {
		let text = message.content.text();
		match message.role.as_str() {
			"system" => prompt.push_str(&format!("{text}\n\n")),
			"assistant" => prompt.push_str(&format!("\n\nAssistant: {text}")),
			_ => prompt.push_str(&format!("\n\nHuman: {text}")),
		}
	}
	prompt.push_str("\n\nAssistant:");
	if force_preamble && anthropic::needs_preamble(&prompt) {
		prompt = anthropic::inject_preamble(&prompt);
	}
	Ok(anthropic::TextCompletionRequest {
		model: request.model.clone(),
		prompt,
		max_tokens_to_sample: request.max_tokens.unwrap_or(crate::schema::DEFAULT_MAX_TOKENS),
		temperature: request.temperature,
		stream: request.stream,
		// §4.2: "stops augmented with \n\nHuman: and \n\nSystem:,
		// deduplicated" — the two are always distinct here since neither
		// comes from caller input, so there's nothing to actually dedup
		// against, but the set is fixed regardless of prompt content.
		stop_sequences: Some(vec![anthropic::REQUIRED_PREAMBLE.to_string(), "\n\nSystem:".to_string()]),
	})
}

/// §4.2: "flatten to a single prompt string with stop `\n\nUser:` appended" —
/// the legacy `/v1/completions` dialect, for clients that still target it
/// instead of chat completions.
pub fn to_openai_text(request: &openai::ChatCompletionRequest) -> ProxyResult<openai::CompletionRequest> {
	let mut prompt = String::new();
	for message in &request.messages {
		let role = match message.role.as_str() {
			"system" => "System",
			"assistant" => "Assistant",
			_ => "User",
		};
		prompt.push_str(&format!("{role}: {}\n\n", message.content.text()));
	}
	prompt.push_str("Assistant:");
	Ok(openai::CompletionRequest {
		model: request.model.clone(),
		prompt,
		max_tokens: request.max_tokens,
		temperature: request.temperature,
		stream: request.stream,
		stop: Some(vec!["\n\nUser:".to_string()]),
	})
}

/// §4.2: "use the last user message as the prompt, requiring a `Image:`
/// marker prefix; reject streaming" — routes a chat-shaped request at
/// image generation instead of text completion.
pub fn to_openai_image(request: &openai::ChatCompletionRequest) -> ProxyResult<openai::ImageGenerationRequest> {
	if request.stream {
		return Err(ProxyError::Validation("image generation does not support streaming".to_string()));
	}
	let last_user = request
		.messages
		.iter()
		.rev()
		.find(|m| m.role == "user")
		.ok_or_else(|| ProxyError::Validation("request has no user message to use as an image prompt".to_string()))?;
	let text = last_user.content.text();
	let prompt = text
		.strip_prefix("Image:")
		.map(str::trim_start)
		.ok_or_else(|| ProxyError::Validation("image prompt must start with an \"Image:\" marker".to_string()))?;
	Ok(openai::ImageGenerationRequest {
		prompt: prompt.to_string(),
		model: "dall-e-3".to_string(),
		size: "1024x1024".to_string(),
		quality: None,
		n: 1,
	})
}

