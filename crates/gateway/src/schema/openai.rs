use serde::{Deserialize, Serialize};

/// A message's content is either a plain string (the common case) or an
/// array of typed parts mixing text and inline images (OpenAI's vision
/// input shape) — `untagged` lets serde pick whichever matches the wire
/// value without a client needing to declare which shape it's sending.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
	Text(String),
	Parts(Vec<ContentPart>),
}

impl Default for Content {
	fn default() -> Self {
		Content::Text(String::new())
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ContentPart {
	Text { text: String },
	ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageUrl {
	pub url: String,
	#[serde(default)]
	pub detail: Option<String>,
}

impl Content {
	/// The concatenation of every text part, in order — non-text parts
	/// contribute nothing. Used by every dialect transformer, none of
	/// which currently re-expresses images in the target dialect (§1
	/// non-goals: no semantic transforms beyond what each translator's
	/// doc comment already claims).
	pub fn text(&self) -> String {
		match self {
			Content::Text(s) => s.clone(),
			Content::Parts(parts) => parts
				.iter()
				.filter_map(|p| match p {
					ContentPart::Text { text } => Some(text.as_str()),
					ContentPart::ImageUrl { .. } => None,
				})
				.collect::<Vec<_>>()
				.join(""),
		}
	}

	pub fn images(&self) -> Vec<&ImageUrl> {
		match self {
			Content::Text(_) => Vec::new(),
			Content::Parts(parts) => parts
				.iter()
				.filter_map(|p| match p {
					ContentPart::ImageUrl { image_url } => Some(image_url),
					ContentPart::Text { .. } => None,
				})
				.collect(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
	pub role: String,
	#[serde(default)]
	pub content: Content,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatCompletionRequest {
	pub model: String,
	pub messages: Vec<Message>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub n: Option<u32>,
	#[serde(default)]
	pub stream: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop: Option<Vec<String>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user: Option<String>,
}

/// The legacy `/v1/completions` dialect: a single flattened prompt string
/// rather than a message list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompletionRequest {
	pub model: String,
	pub prompt: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f32>,
	#[serde(default)]
	pub stream: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stop: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageGenerationRequest {
	pub prompt: String,
	#[serde(default = "default_image_model")]
	pub model: String,
	#[serde(default = "default_size")]
	pub size: String,
	#[serde(default)]
	pub quality: Option<String>,
	#[serde(default = "default_n")]
	pub n: u32,
}

fn default_image_model() -> String {
	"dall-e-3".to_string()
}
fn default_size() -> String {
	"1024x1024".to_string()
}
fn default_n() -> u32 {
	1
}
