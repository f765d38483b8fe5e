//! Per-provider routing: the upstream host and URL path for a given
//! request kind, one small module per service mirroring the shape the
//! teacher uses for its own provider modules (a `Provider` with a fixed
//! `NAME`, a default host, and a `path` lookup keyed by route).

pub mod anthropic;
pub mod aws_bedrock;
pub mod azure_openai;
pub mod google_ai;
pub mod mistral;
pub mod openai;

use relay_core::Strng;

use crate::key::Credential;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteType {
	ChatCompletions,
	Completions,
	Embeddings,
	Messages,
	ImageGeneration,
}

pub trait Provider {
	const NAME: &'static str;

	/// Host to connect to for this request. Most services have a fixed
	/// host; Azure and AWS derive it from the credential (resource name /
	/// region respectively).
	fn host(credential: &Credential) -> Strng;

	fn path(route: RouteType, credential: &Credential) -> String;
}

pub fn name_for(credential: &Credential) -> &'static str {
	match credential {
		Credential::OpenAI { .. } => openai::Provider::NAME,
		Credential::Anthropic { .. } => anthropic::Provider::NAME,
		Credential::AwsBedrock { .. } => aws_bedrock::Provider::NAME,
		Credential::AzureOpenAI { .. } => azure_openai::Provider::NAME,
		Credential::GoogleAI { .. } => google_ai::Provider::NAME,
		Credential::Mistral { .. } => mistral::Provider::NAME,
	}
}

pub fn host_for(credential: &Credential) -> Strng {
	match credential {
		Credential::OpenAI { .. } => openai::Provider::host(credential),
		Credential::Anthropic { .. } => anthropic::Provider::host(credential),
		Credential::AwsBedrock { .. } => aws_bedrock::Provider::host(credential),
		Credential::AzureOpenAI { .. } => azure_openai::Provider::host(credential),
		Credential::GoogleAI { .. } => google_ai::Provider::host(credential),
		Credential::Mistral { .. } => mistral::Provider::host(credential),
	}
}

pub fn path_for(route: RouteType, credential: &Credential) -> String {
	match credential {
		Credential::OpenAI { .. } => openai::Provider::path(route, credential),
		Credential::Anthropic { .. } => anthropic::Provider::path(route, credential),
		Credential::AwsBedrock { .. } => aws_bedrock::Provider::path(route, credential),
		Credential::AzureOpenAI { .. } => azure_openai::Provider::path(route, credential),
		Credential::GoogleAI { .. } => google_ai::Provider::path(route, credential),
		Credential::Mistral { .. } => mistral::Provider::path(route, credential),
	}
}
