use relay_core::Strng;

use super::RouteType;
use crate::key::Credential;

pub const DEFAULT_HOST_STR: &str = "api.openai.com";

pub struct Provider;

impl super::Provider for Provider {
	const NAME: &'static str = "openai";

	fn host(_credential: &Credential) -> Strng {
		relay_core::literal!(DEFAULT_HOST_STR)
	}

	fn path(route: RouteType, _credential: &Credential) -> String {
		path(route).to_string()
	}
}

pub fn path(route: RouteType) -> &'static str {
	match route {
		RouteType::ChatCompletions => "/v1/chat/completions",
		RouteType::Completions => "/v1/completions",
		RouteType::Embeddings => "/v1/embeddings",
		RouteType::ImageGeneration => "/v1/images/generations",
		RouteType::Messages => "/v1/chat/completions",
	}
}
