//! Ties the queue, the provider/signing layer, and the response handler
//! together: given a `Dispatched` request (a prepared request plus a
//! claimed concurrency slot), build the actual outbound HTTP call, send
//! it, classify the result, and feed that classification back into the
//! key pool.

use crate::error::{ProxyError, ProxyResult};
use crate::key::Credential;
use crate::key_pool::KeyPool;
use crate::providers::{self, RouteType};
use crate::queue::Dispatched;
use crate::response::{self, NonStreamingResult, Outcome};
use crate::signing;

/// Turns a classified upstream outcome into the error the rest of the
/// stack acts on: `RateLimited`/`RetryableUpstream`/`RequiresPreamble` are
/// transient (the queue should re-enqueue and try a different/recovered
/// key), everything else is terminal and goes straight back to the
/// caller as the upstream's own status and body.
fn outcome_to_error(outcome: &Outcome, status: u16, body: String) -> ProxyError {
	match outcome {
		Outcome::RateLimited { .. } | Outcome::RetryableUpstream | Outcome::RequiresPreamble => {
			ProxyError::Retryable(format!("upstream {status}: {body}"))
		},
		Outcome::Disable { .. } | Outcome::ClientError | Outcome::Success => ProxyError::Upstream { status, body },
	}
}

pub struct Dispatcher<'a> {
	pub client: &'a reqwest::Client,
	pub pool: &'a KeyPool,
}

impl<'a> Dispatcher<'a> {
	pub fn new(client: &'a reqwest::Client, pool: &'a KeyPool) -> Self {
		Dispatcher { client, pool }
	}

	/// Sends a non-streaming request and returns the client-shaped
	/// response. Streaming requests go through `send_streaming` instead,
	/// since the body has to be forwarded chunk-by-chunk rather than
	/// buffered.
	pub async fn send(&self, dispatched: &Dispatched) -> ProxyResult<NonStreamingResult> {
		let handle = dispatched
			.prepared
			.context
			.key
			.as_ref()
			.ok_or_else(|| ProxyError::Internal("dispatched request has no key".to_string()))?;
		let credential = self
			.pool
			.with_key(handle, |key| key.credential.clone())
			.ok_or_else(|| ProxyError::Internal("key disappeared from pool before dispatch".to_string()))?;

		let response = self.send_upstream(&credential, dispatched).await?;
		let status = response.status().as_u16();
		let headers = response.headers().clone();
		let content_encoding = headers.get(reqwest::header::CONTENT_ENCODING).and_then(|v| v.to_str().ok().map(str::to_string));

		if !(200..300).contains(&status) {
			let body_text = response.text().await.unwrap_or_default();
			let error_body: Option<serde_json::Value> = serde_json::from_str(&body_text).ok();
			let outcome = response::classify(status, &headers, dispatched.prepared.context.family, error_body.as_ref());
			response::apply_outcome(self.pool, handle, &outcome);
			return Err(outcome_to_error(&outcome, status, body_text));
		}

		let raw_body = response.bytes().await.map_err(ProxyError::Network)?;
		let result = response::handle_non_streaming(handle.service, status, content_encoding.as_deref(), raw_body).await?;
		self.pool.record_usage(handle, result.usage);
		Ok(result)
	}

	/// Sends a streaming request and returns the raw upstream byte stream
	/// plus the service it came from, so the caller can forward it
	/// through `response::stream_with_accumulator` while the accumulator
	/// extracts running usage for quota accounting (§4.6, partial-stream
	/// accounting decision in DESIGN.md).
	pub async fn send_streaming(
		&self,
		dispatched: &Dispatched,
	) -> ProxyResult<(crate::model::LLMService, reqwest::Response)> {
		let handle = dispatched
			.prepared
			.context
			.key
			.as_ref()
			.ok_or_else(|| ProxyError::Internal("dispatched request has no key".to_string()))?;
		let credential = self
			.pool
			.with_key(handle, |key| key.credential.clone())
			.ok_or_else(|| ProxyError::Internal("key disappeared from pool before dispatch".to_string()))?;

		let response = self.send_upstream(&credential, dispatched).await?;
		let status = response.status().as_u16();
		let headers = response.headers().clone();
		if !(200..300).contains(&status) {
			let body_text = response.text().await.unwrap_or_default();
			let error_body: Option<serde_json::Value> = serde_json::from_str(&body_text).ok();
			let outcome = response::classify(status, &headers, dispatched.prepared.context.family, error_body.as_ref());
			response::apply_outcome(self.pool, handle, &outcome);
			return Err(outcome_to_error(&outcome, status, body_text));
		}
		Ok((handle.service, response))
	}

	async fn send_upstream(&self, credential: &Credential, dispatched: &Dispatched) -> ProxyResult<reqwest::Response> {
		let host = providers::host_for(credential);
		match credential {
			Credential::AwsBedrock { .. } => self.send_bedrock(credential, dispatched, &host).await,
			Credential::GoogleAI { .. } => {
				let path = providers::path_for(RouteType::ChatCompletions, credential);
				let url = signing::google_ai_url_with_key(&format!("https://{host}{path}"), credential);
				self
					.client
					.post(url)
					.json(&dispatched.prepared.upstream_body)
					.send()
					.await
					.map_err(ProxyError::Network)
			},
			_ => {
				let path = providers::path_for(RouteType::ChatCompletions, credential);
				let builder = self.client.post(format!("https://{host}{path}")).json(&dispatched.prepared.upstream_body);
				signing::apply_simple_auth(credential, builder).send().await.map_err(ProxyError::Network)
			},
		}
	}

	async fn send_bedrock(&self, credential: &Credential, dispatched: &Dispatched, host: &relay_core::Strng) -> ProxyResult<reqwest::Response> {
		let model_id = dispatched.prepared.context.requested_model.as_str();
		let path = providers::aws_bedrock::invoke_path(model_id);
		let body = serde_json::to_vec(&dispatched.prepared.upstream_body).map_err(|e| ProxyError::Internal(e.to_string()))?;
		let uri: http::Uri = format!("https://{host}{path}").parse().map_err(|e| ProxyError::Internal(format!("bad bedrock uri: {e}")))?;
		let mut request = http::Request::builder()
			.method(http::Method::POST)
			.uri(uri)
			.header(http::header::CONTENT_TYPE, "application/json")
			.body(body)
			.map_err(|e| ProxyError::Internal(e.to_string()))?;
		signing::sign_aws_request(&mut request, credential).await?;

		let mut builder = self.client.post(request.uri().to_string());
		for (name, value) in request.headers() {
			if let Ok(v) = value.to_str() {
				builder = builder.header(name.as_str(), v);
			}
		}
		builder.body(request.into_body()).send().await.map_err(ProxyError::Network)
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[test]
	fn rate_limited_and_retryable_outcomes_become_a_retryable_error() {
		let retryable = [
			Outcome::RateLimited { retry_after: Duration::from_secs(5), family: None },
			Outcome::RetryableUpstream,
			Outcome::RequiresPreamble,
		];
		for outcome in retryable {
			assert!(matches!(outcome_to_error(&outcome, 429, "oops".to_string()), ProxyError::Retryable(_)));
		}
	}

	#[test]
	fn disable_and_client_error_outcomes_stay_terminal() {
		let terminal = [Outcome::Disable { reason: "revoked" }, Outcome::ClientError];
		for outcome in terminal {
			let err = outcome_to_error(&outcome, 401, "nope".to_string());
			assert!(matches!(err, ProxyError::Upstream { status: 401, .. }));
		}
	}
}
