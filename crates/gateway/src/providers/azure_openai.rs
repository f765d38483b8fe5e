use relay_core::Strng;

use super::RouteType;
use crate::key::Credential;

/// Azure OpenAI pins an API version per request; kept in one place since a
/// mismatch between client and server expectations here surfaces as an
/// upstream 400 that's otherwise confusing to debug.
pub const API_VERSION: &str = "2024-06-01";

pub struct Provider;

impl super::Provider for Provider {
	const NAME: &'static str = "azure-openai";

	fn host(credential: &Credential) -> Strng {
		let resource_name = match credential {
			Credential::AzureOpenAI { resource_name, .. } => resource_name.as_str(),
			_ => unreachable!("azure_openai::Provider used with non-Azure credential"),
		};
		relay_core::format!("{resource_name}.openai.azure.com")
	}

	fn path(route: RouteType, credential: &Credential) -> String {
		let deployment_id = match credential {
			Credential::AzureOpenAI { deployment_id, .. } => deployment_id.as_str(),
			_ => unreachable!("azure_openai::Provider used with non-Azure credential"),
		};
		let op = match route {
			RouteType::ChatCompletions | RouteType::Messages => "chat/completions",
			RouteType::Completions => "completions",
			RouteType::Embeddings => "embeddings",
			RouteType::ImageGeneration => "images/generations",
		};
		format!("/openai/deployments/{deployment_id}/{op}?api-version={API_VERSION}")
	}
}
