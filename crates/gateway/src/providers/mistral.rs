use relay_core::Strng;

use super::RouteType;
use crate::key::Credential;

pub const DEFAULT_HOST_STR: &str = "api.mistral.ai";

pub struct Provider;

impl super::Provider for Provider {
	const NAME: &'static str = "mistral-ai";

	fn host(_credential: &Credential) -> Strng {
		relay_core::literal!(DEFAULT_HOST_STR)
	}

	fn path(route: RouteType, _credential: &Credential) -> String {
		match route {
			RouteType::Embeddings => "/v1/embeddings".to_string(),
			_ => "/v1/chat/completions".to_string(),
		}
	}
}
