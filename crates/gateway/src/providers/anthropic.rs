use relay_core::Strng;

use super::RouteType;
use crate::key::Credential;

pub const DEFAULT_HOST_STR: &str = "api.anthropic.com";

pub struct Provider;

impl super::Provider for Provider {
	const NAME: &'static str = "anthropic";

	fn host(_credential: &Credential) -> Strng {
		relay_core::literal!(DEFAULT_HOST_STR)
	}

	fn path(route: RouteType, _credential: &Credential) -> String {
		path(route).to_string()
	}
}

pub fn path(route: RouteType) -> &'static str {
	match route {
		RouteType::Messages => "/v1/messages",
		RouteType::Completions => "/v1/complete",
		_ => "/v1/messages",
	}
}
