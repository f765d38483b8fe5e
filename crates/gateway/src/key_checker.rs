//! Background key health probing (§4.3): on startup every configured key
//! is probed once, in per-service batches, so a dead key is known before
//! the first real request reaches it; afterwards a steady-state loop
//! re-probes whichever keys are past their service's recheck period,
//! spread out rather than re-probing everything at once.
//!
//! Each service gets its own probe: OpenAI and Azure list models, Anthropic
//! sends a canary completion looking for the "please answer ethically"
//! injection some accounts get steered toward, and Bedrock both exercises
//! `InvokeModel` and separately checks whether invocation logging is on for
//! the account. Google AI and Mistral have no cheap health signal worth a
//! network round trip on every tick, so their keys are left `Unknown` and
//! inferred from live traffic outcomes instead (§4.6).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures_util::future::join_all;

use crate::key::Credential;
use crate::key_pool::{KeyHandle, KeyPool};
use crate::model::{self, LLMService, ModelFamily};
use crate::providers::{self, RouteType};
use crate::signing;

#[cfg(test)]
#[path = "key_checker_tests.rs"]
mod tests;

/// How often the steady-state loop wakes up to check which keys are stale.
/// Shorter than every service's `check_period` so per-handle staleness is
/// caught promptly rather than only at whole-period boundaries.
pub const STEADY_STATE_TICK: Duration = Duration::from_secs(60);

/// Gap between startup batches for the same service, so a burst of probes
/// doesn't itself look like abuse to the upstream.
pub const STARTUP_BATCH_GAP: Duration = Duration::from_millis(250);

/// §4.3: a 429 hit *during* a probe shouldn't make the key wait out its
/// full `check_period` before being tried again — back-date `last_checked`
/// so the next steady-state tick re-probes roughly this long from now.
pub const PROBE_RATE_LIMIT_RECHECK: Duration = Duration::from_secs(10);

/// §4.3 `KEY_CHECK_PERIOD`: how stale a key's last probe has to be before
/// the steady-state loop re-probes it. Anthropic and OpenAI have spec-given
/// values; the rest default to a conservative half hour.
pub fn check_period(service: LLMService) -> Duration {
	match service {
		LLMService::Anthropic => Duration::from_secs(60 * 60),
		LLMService::OpenAI => Duration::from_secs(5 * 60),
		LLMService::AwsBedrock | LLMService::AzureOpenAI | LLMService::GoogleAI | LLMService::Mistral => {
			Duration::from_secs(30 * 60)
		},
	}
}

/// §4.3: how many keys of one service are probed concurrently in a single
/// startup batch. Anthropic and OpenAI have spec-given values; the rest
/// default to OpenAI's.
pub fn batch_size(service: LLMService) -> usize {
	match service {
		LLMService::Anthropic => 6,
		LLMService::OpenAI
		| LLMService::AwsBedrock
		| LLMService::AzureOpenAI
		| LLMService::GoogleAI
		| LLMService::Mistral => 12,
	}
}

pub struct KeyChecker {
	pub client: reqwest::Client,
}

impl Default for KeyChecker {
	fn default() -> Self {
		KeyChecker { client: reqwest::Client::new() }
	}
}

impl KeyChecker {
	pub fn new(client: reqwest::Client) -> Self {
		KeyChecker { client }
	}

	/// Probes every key currently in the pool once, batched per service so
	/// one service's key count doesn't starve another's. Intended to run
	/// once at startup before traffic is accepted.
	pub async fn startup_probe(&self, pool: &KeyPool) {
		let mut by_service: HashMap<LLMService, Vec<KeyHandle>> = HashMap::new();
		for handle in pool.all_handles() {
			by_service.entry(handle.service).or_default().push(handle);
		}
		join_all(by_service.into_iter().map(|(service, handles)| self.probe_in_batches(pool, service, handles))).await;
	}

	async fn probe_in_batches(&self, pool: &KeyPool, service: LLMService, handles: Vec<KeyHandle>) {
		let size = batch_size(service).max(1);
		let mut chunks = handles.chunks(size).peekable();
		while let Some(chunk) = chunks.next() {
			join_all(chunk.iter().map(|handle| self.probe_and_apply(pool, handle))).await;
			if chunks.peek().is_some() {
				tokio::time::sleep(STARTUP_BATCH_GAP).await;
			}
		}
	}

	/// Runs forever, re-probing keys whose last check is older than their
	/// service's `check_period`, checking every `STEADY_STATE_TICK`.
	pub async fn run_steady_state(&self, pool: &KeyPool) {
		loop {
			tokio::time::sleep(STEADY_STATE_TICK).await;
			let stale: Vec<KeyHandle> = pool
				.all_handles()
				.into_iter()
				.filter(|handle| {
					pool
						.with_key(handle, |key| {
							key.last_checked.map(|t| t.elapsed() >= check_period(handle.service)).unwrap_or(true)
						})
						.unwrap_or(false)
				})
				.collect();
			join_all(stale.iter().map(|handle| self.probe_and_apply(pool, handle))).await;
		}
	}

	async fn probe_and_apply(&self, pool: &KeyPool, handle: &KeyHandle) {
		let Some(credential) = pool.with_key(handle, |key| key.credential.clone()) else { return };
		let outcome = self.probe(&credential).await;
		let service = handle.service;
		pool.with_key_mut(handle, move |key| {
			let now = Instant::now();
			match outcome {
				ProbeOutcome::Healthy(families) => {
					key.last_checked = Some(now);
					key.clear_rate_limit();
					key.model_families = families;
				},
				ProbeOutcome::HealthyAnthropic { is_pozzed } => {
					key.last_checked = Some(now);
					key.clear_rate_limit();
					key.is_pozzed = Some(is_pozzed);
				},
				ProbeOutcome::HealthyAws { logging_enabled } => {
					key.last_checked = Some(now);
					key.clear_rate_limit();
					key.aws_logging_enabled = Some(logging_enabled);
					key.model_families = vec![ModelFamily::AwsClaude];
				},
				ProbeOutcome::Invalid(reason) => {
					key.last_checked = Some(now);
					key.disable(reason);
				},
				ProbeOutcome::RateLimited => {
					let lookback = check_period(service).checked_sub(PROBE_RATE_LIMIT_RECHECK).unwrap_or(Duration::ZERO);
					key.last_checked = Some(now.checked_sub(lookback).unwrap_or(now));
				},
				ProbeOutcome::Unknown => {
					key.last_checked = Some(now);
				},
			}
		});
	}

	async fn probe(&self, credential: &Credential) -> ProbeOutcome {
		match credential {
			Credential::OpenAI { .. } => self.probe_openai(credential).await,
			Credential::Anthropic { .. } => self.probe_anthropic(credential).await,
			Credential::AwsBedrock { .. } => self.probe_aws_bedrock(credential).await,
			Credential::AzureOpenAI { .. } => self.probe_azure(credential).await,
			// Google AI and Mistral have no lightweight health endpoint
			// worth spending a network round trip on for every steady-state
			// tick; their health is instead inferred from the
			// classification the response handler already applies to real
			// traffic (§4.6).
			Credential::GoogleAI { .. } | Credential::Mistral { .. } => ProbeOutcome::Unknown,
		}
	}

	async fn probe_openai(&self, credential: &Credential) -> ProbeOutcome {
		let host = providers::host_for(credential);
		let url = format!("https://{host}/v1/models");
		let request = signing::apply_simple_auth(credential, self.client.get(&url));
		match request.send().await {
			Ok(resp) if resp.status() == reqwest::StatusCode::UNAUTHORIZED => {
				ProbeOutcome::Invalid("401 from /v1/models during health check".to_string())
			},
			Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => ProbeOutcome::RateLimited,
			Ok(resp) if resp.status().is_success() => match resp.json::<ModelsResponse>().await {
				Ok(models) => {
					let families = models
						.data
						.iter()
						.map(|m| model::resolve(LLMService::OpenAI, &m.id))
						.collect::<std::collections::HashSet<_>>()
						.into_iter()
						.collect();
					ProbeOutcome::Healthy(families)
				},
				Err(_) => ProbeOutcome::Unknown,
			},
			_ => ProbeOutcome::Unknown,
		}
	}

	/// §4.3: a canary completion; accounts that have been steered toward a
	/// more cautious system prompt answer it with injected language
	/// ("please answer ethically") that a plain key doesn't see.
	async fn probe_anthropic(&self, credential: &Credential) -> ProbeOutcome {
		let host = providers::host_for(credential);
		let url = format!("https://{host}{}", providers::anthropic::path(RouteType::Completions));
		let body = serde_json::json!({
			"model": "claude-instant-1.2",
			"prompt": "\n\nHuman: test\n\nAssistant:",
			"max_tokens_to_sample": 1,
		});
		let request = signing::apply_simple_auth(credential, self.client.post(&url).json(&body));
		match request.send().await {
			Ok(resp) if resp.status() == reqwest::StatusCode::UNAUTHORIZED => {
				ProbeOutcome::Invalid("401 from /v1/complete during health check".to_string())
			},
			Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => ProbeOutcome::RateLimited,
			Ok(resp) if resp.status().is_success() => {
				let text = resp.text().await.unwrap_or_default();
				ProbeOutcome::HealthyAnthropic { is_pozzed: text.contains("please answer ethically") }
			},
			_ => ProbeOutcome::Unknown,
		}
	}

	/// §4.3: exercises `InvokeModel` with a minimal canary prompt, then
	/// separately checks `GetModelInvocationLoggingConfiguration` so the
	/// pool knows whether the account has invocation logging turned on.
	async fn probe_aws_bedrock(&self, credential: &Credential) -> ProbeOutcome {
		let Credential::AwsBedrock { .. } = credential else { return ProbeOutcome::Unknown };
		let host = providers::host_for(credential);
		let model_id = "anthropic.claude-instant-v1";
		let path = providers::aws_bedrock::invoke_path(model_id);
		let body = match serde_json::to_vec(&serde_json::json!({
			"prompt": "\n\nHuman: test\n\nAssistant:",
			"max_tokens_to_sample": 1,
		})) {
			Ok(body) => body,
			Err(_) => return ProbeOutcome::Unknown,
		};
		let Ok(uri) = format!("https://{host}{path}").parse::<http::Uri>() else { return ProbeOutcome::Unknown };
		let Ok(mut request) =
			http::Request::builder().method(http::Method::POST).uri(uri).header(http::header::CONTENT_TYPE, "application/json").body(body)
		else {
			return ProbeOutcome::Unknown;
		};
		if signing::sign_aws_request(&mut request, credential).await.is_err() {
			return ProbeOutcome::Unknown;
		}
		let Ok(resp) = self.send_signed(&request).await else { return ProbeOutcome::Unknown };
		match resp.status() {
			reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
				return ProbeOutcome::Invalid(format!("{} from bedrock invoke during health check", resp.status()));
			},
			reqwest::StatusCode::TOO_MANY_REQUESTS => return ProbeOutcome::RateLimited,
			_ => {},
		}
		let logging_enabled = self.probe_aws_logging_config(credential).await;
		ProbeOutcome::HealthyAws { logging_enabled }
	}

	async fn probe_aws_logging_config(&self, credential: &Credential) -> bool {
		let Credential::AwsBedrock { region, .. } = credential else { return false };
		let Ok(uri) = format!("https://bedrock.{region}.amazonaws.com/logging/modelinvocations").parse::<http::Uri>() else {
			return false;
		};
		let Ok(mut request) = http::Request::builder().method(http::Method::GET).uri(uri).body(Vec::new()) else {
			return false;
		};
		if signing::sign_aws_request(&mut request, credential).await.is_err() {
			return false;
		}
		let Ok(resp) = self.send_signed(&request).await else { return false };
		if !resp.status().is_success() {
			return false;
		}
		match resp.json::<LoggingConfigResponse>().await {
			Ok(parsed) => parsed.logging_config.map(|c| c.is_enabled()).unwrap_or(false),
			Err(_) => false,
		}
	}

	/// Sends an already-SigV4-signed request through the shared client,
	/// mirroring how `dispatch::send_bedrock` replays a signed request.
	async fn send_signed(&self, request: &http::Request<Vec<u8>>) -> reqwest::Result<reqwest::Response> {
		let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
		let mut builder = self.client.request(method, request.uri().to_string());
		for (name, value) in request.headers() {
			if let Ok(v) = value.to_str() {
				builder = builder.header(name.as_str(), v);
			}
		}
		builder.body(request.body().clone()).send().await
	}

	async fn probe_azure(&self, credential: &Credential) -> ProbeOutcome {
		let Credential::AzureOpenAI { deployment_id, .. } = credential else { return ProbeOutcome::Unknown };
		let host = providers::host_for(credential);
		let url = format!("https://{host}/openai/models?api-version={}", providers::azure_openai::API_VERSION);
		let request = signing::apply_simple_auth(credential, self.client.get(&url));
		match request.send().await {
			Ok(resp) if resp.status() == reqwest::StatusCode::UNAUTHORIZED || resp.status() == reqwest::StatusCode::FORBIDDEN => {
				ProbeOutcome::Invalid(format!("{} from /openai/models during health check", resp.status()))
			},
			Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => ProbeOutcome::RateLimited,
			Ok(resp) if resp.status().is_success() => {
				// Azure ties one deployment to one model; the list endpoint
				// only confirms the credential works, so the family still
				// comes from resolving the deployment id itself.
				ProbeOutcome::Healthy(vec![model::resolve(LLMService::AzureOpenAI, deployment_id)])
			},
			_ => ProbeOutcome::Unknown,
		}
	}
}

enum ProbeOutcome {
	Healthy(Vec<ModelFamily>),
	HealthyAnthropic { is_pozzed: bool },
	HealthyAws { logging_enabled: bool },
	Invalid(String),
	/// Hit a 429 mid-probe; the key's own state is unknown, but `last_checked`
	/// still gets backed off per `PROBE_RATE_LIMIT_RECHECK` so it's retried
	/// soon rather than waiting a full `check_period`.
	RateLimited,
	Unknown,
}

#[derive(serde::Deserialize)]
struct ModelsResponse {
	data: Vec<ModelEntry>,
}

#[derive(serde::Deserialize)]
struct ModelEntry {
	id: String,
}

#[derive(serde::Deserialize)]
struct LoggingConfigResponse {
	#[serde(default, rename = "loggingConfig")]
	logging_config: Option<LoggingConfig>,
}

#[derive(serde::Deserialize)]
struct LoggingConfig {
	#[serde(default, rename = "textDataDeliveryEnabled")]
	text_data_delivery_enabled: Option<bool>,
	#[serde(default, rename = "imageDataDeliveryEnabled")]
	image_data_delivery_enabled: Option<bool>,
	#[serde(default, rename = "embeddingDataDeliveryEnabled")]
	embedding_data_delivery_enabled: Option<bool>,
}

impl LoggingConfig {
	fn is_enabled(&self) -> bool {
		self.text_data_delivery_enabled.unwrap_or(false)
			|| self.image_data_delivery_enabled.unwrap_or(false)
			|| self.embedding_data_delivery_enabled.unwrap_or(false)
	}
}

