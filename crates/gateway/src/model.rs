//! The model/family/service taxonomy that partitions the key pool, the
//! request queue, and the per-provider dialect layer.
//!
//! `LLMService` is which upstream vendor API a key belongs to.
//! `ModelFamily` is the finer partition used for quota accounting and queue
//! fairness: two keys on the same service can still serve disjoint families
//! (e.g. an OpenAI key scoped to `gpt-4` vs one scoped to `turbo`), and two
//! services can expose the "same" model under different families (Claude
//! direct vs Claude-on-Bedrock are accounted separately because they draw
//! from different key pools).

use once_cell::sync::Lazy;
use regex::Regex;
use relay_core::Strng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LLMService {
	OpenAI,
	Anthropic,
	AwsBedrock,
	AzureOpenAI,
	GoogleAI,
	Mistral,
}

impl LLMService {
	pub fn as_str(&self) -> &'static str {
		match self {
			LLMService::OpenAI => "openai",
			LLMService::Anthropic => "anthropic",
			LLMService::AwsBedrock => "aws",
			LLMService::AzureOpenAI => "azure",
			LLMService::GoogleAI => "google-ai",
			LLMService::Mistral => "mistral-ai",
		}
	}
}

/// Closed partition of upstream models. Every queue partition, quota bucket,
/// and key-pool registry is keyed by one of these, never by a raw model
/// string, so typos in client-supplied model names can't create unbounded
/// partitions. The set is closed and exhaustive: an unrecognized model
/// string resolves to its service's catch-all family rather than growing
/// the enum at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
	Turbo,
	Gpt4,
	Gpt432k,
	Gpt4Turbo,
	DallE,
	Claude,
	GeminiPro,
	MistralTiny,
	MistralSmall,
	MistralMedium,
	AwsClaude,
	AzureTurbo,
	AzureGpt4,
	AzureGpt432k,
	AzureGpt4Turbo,
}

impl ModelFamily {
	pub fn service(&self) -> LLMService {
		use ModelFamily::*;
		match self {
			Turbo | Gpt4 | Gpt432k | Gpt4Turbo | DallE => LLMService::OpenAI,
			Claude => LLMService::Anthropic,
			AwsClaude => LLMService::AwsBedrock,
			AzureTurbo | AzureGpt4 | AzureGpt432k | AzureGpt4Turbo => LLMService::AzureOpenAI,
			GeminiPro => LLMService::GoogleAI,
			MistralTiny | MistralSmall | MistralMedium => LLMService::Mistral,
		}
	}

	pub fn as_str(&self) -> &'static str {
		use ModelFamily::*;
		match self {
			Turbo => "turbo",
			Gpt4 => "gpt4",
			Gpt432k => "gpt4-32k",
			Gpt4Turbo => "gpt4-turbo",
			DallE => "dall-e",
			Claude => "claude",
			AwsClaude => "aws-claude",
			AzureTurbo => "azure-turbo",
			AzureGpt4 => "azure-gpt4",
			AzureGpt432k => "azure-gpt4-32k",
			AzureGpt4Turbo => "azure-gpt4-turbo",
			GeminiPro => "gemini-pro",
			MistralTiny => "mistral-tiny",
			MistralSmall => "mistral-small",
			MistralMedium => "mistral-medium",
		}
	}

	/// Static per-family context window, in tokens, per §4.4 step 6. The
	/// pipeline's `validateContextSize` stage takes `min(this, the
	/// configured proxy-wide ceiling)` as the final limit, so this table
	/// only needs to track each family's hard vendor ceiling.
	pub fn context_window(&self) -> u64 {
		use ModelFamily::*;
		match self {
			Turbo => 16_385,
			Gpt4 => 8_192,
			Gpt432k => 32_768,
			Gpt4Turbo => 128_000,
			DallE => 0,
			Claude | AwsClaude => 200_000,
			AzureTurbo => 16_385,
			AzureGpt4 => 8_192,
			AzureGpt432k => 32_768,
			AzureGpt4Turbo => 128_000,
			GeminiPro => 32_760,
			MistralTiny | MistralSmall | MistralMedium => 32_000,
		}
	}

	/// §4.4 step 6: Claude degrades rather than errors when a prompt runs
	/// over its nominal context window, so the proxy applies a 0.95 safety
	/// factor to its advertised window instead of trusting it exactly.
	pub fn is_claude(&self) -> bool {
		matches!(self, ModelFamily::Claude | ModelFamily::AwsClaude)
	}
}

/// One entry in a prioritized model-name resolution table: first matching
/// pattern wins, so more specific patterns (e.g. `gpt-4-32k`) must be listed
/// ahead of looser ones (e.g. `gpt-4`). The last entry in every table is a
/// catch-all (`.`) that resolves an unrecognized model string to the
/// service's default family instead of leaving it unresolved.
struct Pattern {
	re: Regex,
	family: ModelFamily,
}

fn table(pairs: &[(&str, ModelFamily)]) -> Vec<Pattern> {
	pairs
		.iter()
		.map(|(pat, family)| Pattern {
			re: Regex::new(pat).expect("static model pattern must compile"),
			family: *family,
		})
		.collect()
}

static OPENAI_TABLE: Lazy<Vec<Pattern>> = Lazy::new(|| {
	table(&[
		(r"^dall-e", ModelFamily::DallE),
		(r"^gpt-4-32k", ModelFamily::Gpt432k),
		(r"^gpt-4-turbo|^gpt-4-\d{4}-preview|^gpt-4-vision|^gpt-4o", ModelFamily::Gpt4Turbo),
		(r"^gpt-4", ModelFamily::Gpt4),
		(r"^gpt-3\.5-turbo|^text-davinci", ModelFamily::Turbo),
		(r".", ModelFamily::Turbo),
	])
});

static ANTHROPIC_TABLE: Lazy<Vec<Pattern>> = Lazy::new(|| table(&[(r".", ModelFamily::Claude)]));

static AWS_TABLE: Lazy<Vec<Pattern>> = Lazy::new(|| table(&[(r".", ModelFamily::AwsClaude)]));

static AZURE_TABLE: Lazy<Vec<Pattern>> = Lazy::new(|| {
	table(&[
		(r"^gpt-4-32k", ModelFamily::AzureGpt432k),
		(r"^gpt-4-turbo|^gpt-4-\d{4}-preview|^gpt-4o", ModelFamily::AzureGpt4Turbo),
		(r"^gpt-4", ModelFamily::AzureGpt4),
		(r"^gpt-3\.5-turbo", ModelFamily::AzureTurbo),
		(r".", ModelFamily::AzureTurbo),
	])
});

static MISTRAL_TABLE: Lazy<Vec<Pattern>> = Lazy::new(|| {
	table(&[
		(r"tiny", ModelFamily::MistralTiny),
		(r"medium", ModelFamily::MistralMedium),
		(r"small", ModelFamily::MistralSmall),
		(r".", ModelFamily::MistralSmall),
	])
});

/// Resolve a client-supplied model string to a `ModelFamily`, scoped to the
/// service it was requested against (the same string can mean different
/// things on different services, e.g. Azure deployment IDs vs OpenAI model
/// IDs). Every table ends in a catch-all pattern, so this always resolves.
pub fn resolve(service: LLMService, requested_model: &str) -> ModelFamily {
	if service == LLMService::GoogleAI {
		return ModelFamily::GeminiPro;
	}
	let table: &[Pattern] = match service {
		LLMService::OpenAI => &OPENAI_TABLE,
		LLMService::Anthropic => &ANTHROPIC_TABLE,
		LLMService::AwsBedrock => &AWS_TABLE,
		LLMService::AzureOpenAI => &AZURE_TABLE,
		LLMService::Mistral => &MISTRAL_TABLE,
		LLMService::GoogleAI => unreachable!(),
	};
	table
		.iter()
		.find(|p| p.re.is_match(requested_model))
		.map(|p| p.family)
		.expect("every resolution table ends in a catch-all pattern")
}

/// The wire format a client request/response is expressed in. Distinct from
/// `LLMService` because a single service can accept more than one dialect
/// (e.g. Anthropic's legacy text-completions API vs its Messages API).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum APIFormat {
	OpenAIChat,
	OpenAIText,
	OpenAIImage,
	AnthropicChat,
	AnthropicText,
	GoogleAI,
	MistralAI,
}

impl APIFormat {
	pub fn default_service(&self) -> LLMService {
		match self {
			APIFormat::OpenAIChat | APIFormat::OpenAIText | APIFormat::OpenAIImage => LLMService::OpenAI,
			APIFormat::AnthropicChat | APIFormat::AnthropicText => LLMService::Anthropic,
			APIFormat::GoogleAI => LLMService::GoogleAI,
			APIFormat::MistralAI => LLMService::Mistral,
		}
	}
}

pub fn service_label(service: LLMService) -> Strng {
	relay_core::literal!(service.as_str())
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	#[case("gpt-3.5-turbo", ModelFamily::Turbo)]
	#[case("gpt-4", ModelFamily::Gpt4)]
	#[case("gpt-4-32k", ModelFamily::Gpt432k)]
	#[case("gpt-4-turbo-preview", ModelFamily::Gpt4Turbo)]
	#[case("gpt-4o-mini", ModelFamily::Gpt4Turbo)]
	#[case("dall-e-3", ModelFamily::DallE)]
	#[case("o1-preview", ModelFamily::Turbo)]
	fn resolves_openai_families(#[case] model: &str, #[case] expected: ModelFamily) {
		assert_eq!(resolve(LLMService::OpenAI, model), expected);
	}

	#[test]
	fn resolves_anthropic_models_to_claude() {
		assert_eq!(resolve(LLMService::Anthropic, "claude-3-opus-20240229"), ModelFamily::Claude);
		assert_eq!(resolve(LLMService::Anthropic, "claude-3-sonnet-20240229"), ModelFamily::Claude);
	}

	#[test]
	fn resolves_bedrock_model_ids_to_aws_claude() {
		assert_eq!(
			resolve(LLMService::AwsBedrock, "anthropic.claude-3-sonnet-20240229-v1:0"),
			ModelFamily::AwsClaude
		);
	}

	#[rstest]
	#[case("mistral-tiny", ModelFamily::MistralTiny)]
	#[case("mistral-small-latest", ModelFamily::MistralSmall)]
	#[case("mistral-medium", ModelFamily::MistralMedium)]
	#[case("mistral-large-2402", ModelFamily::MistralSmall)]
	fn resolves_mistral_families(#[case] model: &str, #[case] expected: ModelFamily) {
		assert_eq!(resolve(LLMService::Mistral, model), expected);
	}

	#[test]
	fn google_ai_always_resolves_to_gemini_pro() {
		assert_eq!(resolve(LLMService::GoogleAI, "gemini-1.5-pro"), ModelFamily::GeminiPro);
		assert_eq!(resolve(LLMService::GoogleAI, "anything"), ModelFamily::GeminiPro);
	}

	#[test]
	fn family_maps_back_to_its_service() {
		assert_eq!(ModelFamily::AzureGpt4Turbo.service(), LLMService::AzureOpenAI);
		assert_eq!(ModelFamily::AwsClaude.service(), LLMService::AwsBedrock);
		assert_eq!(ModelFamily::MistralTiny.service(), LLMService::Mistral);
	}

	#[rstest]
	#[case(ModelFamily::Turbo, 16_385)]
	#[case(ModelFamily::Gpt432k, 32_768)]
	#[case(ModelFamily::Gpt4Turbo, 128_000)]
	#[case(ModelFamily::Claude, 200_000)]
	#[case(ModelFamily::GeminiPro, 32_760)]
	fn context_window_is_per_family(#[case] family: ModelFamily, #[case] expected: u64) {
		assert_eq!(family.context_window(), expected);
	}

	#[rstest]
	#[case(ModelFamily::Claude, true)]
	#[case(ModelFamily::AwsClaude, true)]
	#[case(ModelFamily::Gpt4, false)]
	#[case(ModelFamily::MistralMedium, false)]
	fn is_claude_identifies_anthropic_families_only(#[case] family: ModelFamily, #[case] expected: bool) {
		assert_eq!(family.is_claude(), expected);
	}
}
