use relay_core::Strng;

use super::RouteType;
use crate::key::Credential;

pub struct Provider;

impl super::Provider for Provider {
	const NAME: &'static str = "aws-bedrock";

	fn host(credential: &Credential) -> Strng {
		let region = match credential {
			Credential::AwsBedrock { region, .. } => region.as_str(),
			_ => unreachable!("aws_bedrock::Provider used with non-AWS credential"),
		};
		relay_core::format!("bedrock-runtime.{region}.amazonaws.com")
	}

	/// Bedrock has no single REST path: the model id is part of the path
	/// itself, so the real path is built once the request model is known
	/// (see `queue`/`response` invocation sites which call
	/// `invoke_path`/`invoke_stream_path` directly instead of this generic
	/// `path` hook).
	fn path(route: RouteType, _credential: &Credential) -> String {
		match route {
			RouteType::ChatCompletions | RouteType::Messages => String::new(),
			_ => String::new(),
		}
	}
}

pub fn invoke_path(model_id: &str) -> String {
	format!("/model/{}/invoke", urlencode(model_id))
}

pub fn invoke_stream_path(model_id: &str) -> String {
	format!("/model/{}/invoke-with-response-stream", urlencode(model_id))
}

fn urlencode(s: &str) -> String {
	s.replace(':', "%3A")
}
