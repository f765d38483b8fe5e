use relay_core::Strng;

use super::RouteType;
use crate::key::Credential;

pub const DEFAULT_HOST_STR: &str = "generativelanguage.googleapis.com";

pub struct Provider;

impl super::Provider for Provider {
	const NAME: &'static str = "google-ai";

	fn host(_credential: &Credential) -> Strng {
		relay_core::literal!(DEFAULT_HOST_STR)
	}

	fn path(route: RouteType, _credential: &Credential) -> String {
		path(route).to_string()
	}
}

pub fn path(route: RouteType) -> &'static str {
	match route {
		RouteType::ChatCompletions | RouteType::Messages => "/v1beta/models",
		_ => "/v1beta/models",
	}
}

/// Builds the model-specific generateContent/streamGenerateContent path;
/// Google AI puts both the model id and the `key=` credential in the URL,
/// unlike every other service here, so this is handled outside the shared
/// `Provider::path` hook.
pub fn generate_content_path(model: &str, stream: bool) -> String {
	let op = if stream { "streamGenerateContent" } else { "generateContent" };
	format!("/v1beta/models/{model}:{op}")
}
