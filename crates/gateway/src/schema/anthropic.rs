use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
	pub role: String,
	pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessagesRequest {
	pub model: String,
	pub messages: Vec<Message>,
	/// Unlike OpenAI, Anthropic's Messages API requires `max_tokens` on
	/// every request; the validator fills this in from the shared default
	/// rather than rejecting the request when it's missing, matching how
	/// the rest of the pipeline treats it as a normalization concern.
	#[serde(default)]
	pub max_tokens: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f32>,
	#[serde(default)]
	pub stream: bool,
}

/// The legacy text-completions dialect, which some clients (older RisuAI,
/// Agnai builds) still send. Requires a single already-formatted prompt
/// string using Anthropic's `\n\nHuman: ... \n\nAssistant:` framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextCompletionRequest {
	pub model: String,
	pub prompt: String,
	pub max_tokens_to_sample: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f32>,
	#[serde(default)]
	pub stream: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop_sequences: Option<Vec<String>>,
}

/// Anthropic rejects text-completion prompts that don't begin with the
/// `\n\nHuman:` preamble; the pipeline injects it once on a 400 response
/// that names this specifically rather than always prepending it (some
/// clients already include it).
pub const REQUIRED_PREAMBLE: &str = "\n\nHuman:";

pub fn needs_preamble(prompt: &str) -> bool {
	!prompt.trim_start().starts_with("Human:") && !prompt.starts_with(REQUIRED_PREAMBLE)
}

pub fn inject_preamble(prompt: &str) -> String {
	format!("{REQUIRED_PREAMBLE} {prompt}\n\nAssistant:")
}
