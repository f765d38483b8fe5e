use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Part {
	pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Content {
	pub role: String,
	pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct GenerationConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_output_tokens: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub candidate_count: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SafetySetting {
	pub category: String,
	pub threshold: String,
}

/// §4.2: "safety settings set to `BLOCK_NONE` across all categories" —
/// this proxy doesn't apply its own content moderation, so it asks the
/// upstream not to apply its default thresholds either, for all four
/// categories Google AI's `generateContent` recognizes.
pub fn block_none_safety_settings() -> Vec<SafetySetting> {
	[
		"HARM_CATEGORY_HARASSMENT",
		"HARM_CATEGORY_HATE_SPEECH",
		"HARM_CATEGORY_SEXUALLY_EXPLICIT",
		"HARM_CATEGORY_DANGEROUS_CONTENT",
	]
	.into_iter()
	.map(|category| SafetySetting { category: category.to_string(), threshold: "BLOCK_NONE".to_string() })
	.collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateContentRequest {
	pub contents: Vec<Content>,
	#[serde(default)]
	pub generation_config: GenerationConfig,
	pub safety_settings: Vec<SafetySetting>,
}
