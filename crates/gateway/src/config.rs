//! Environment-variable configuration (§6). Each upstream service reads
//! its credentials from one comma/colon-delimited env var; everything
//! else is a scalar knob with a sane default so the proxy can boot with
//! nothing set beyond at least one provider's keys.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use base64::Engine;
use secrecy::SecretString;

use crate::key::{Credential, Key};
use crate::model::ModelFamily;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// §4.5: which end of a partition's FIFO the dispatch tick drains from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DequeueStrategy {
	#[default]
	Fair,
	Random,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub port: u16,
	pub gatekeeper: Gatekeeper,
	pub max_ips_per_user: Option<usize>,
	pub log_format: LogFormat,
	/// §6 `MAX_CONTEXT_TOKENS_OPENAI`/`MAX_CONTEXT_TOKENS_ANTHROPIC`: an
	/// operator-configured ceiling on top of each family's own vendor
	/// context window (§4.4 step 6 takes the minimum of the two).
	pub max_context_tokens_openai: Option<u64>,
	pub max_context_tokens_anthropic: Option<u64>,
	pub max_output_tokens_openai: Option<u64>,
	pub max_output_tokens_anthropic: Option<u64>,
	/// §4.4 step 9: services a vision-bearing prompt may be sent to
	/// without the caller being a `special` user. Empty by default —
	/// vision must be explicitly allowed per deployment.
	pub allowed_vision_services: Vec<crate::model::LLMService>,
	/// §4.5: per-identifier concurrency overrides, keyed by the identifier
	/// itself (a user token or an IP). Every identifier defaults to a cap
	/// of 1 concurrent request; an entry here raises that, e.g. for a
	/// shared egress IP a third-party aggregator funnels many distinct
	/// end users through.
	pub shared_identifier_limits: std::collections::HashMap<String, u32>,
	/// §4.5 `DEQUEUE_STRATEGY`: `fair` (smallest `startTime`, i.e. FIFO) or
	/// `random`, selected once at boot and applied to every partition.
	pub dequeue_strategy: DequeueStrategy,
	/// §4.4/§6 `TOKEN_QUOTA`: the default per-family token quota assigned to
	/// every newly-seen user, parsed as `family:quota` pairs. A family with
	/// no entry here has no quota for new users (unlimited).
	pub default_token_quota: HashMap<ModelFamily, u64>,
	/// §6 `QUOTA_REFRESH_PERIOD`: how often accumulated per-user token usage
	/// resets to zero. `None` means usage never resets on its own.
	pub quota_refresh_period: Option<Duration>,
	/// §3/§6 `ALLOWED_MODEL_FAMILIES`: if non-empty, the closed set of
	/// families this deployment will serve at all; a resolved family
	/// outside this set is rejected before it ever reaches the key pool.
	/// Empty means every family in the closed enum is allowed.
	pub allowed_model_families: Vec<ModelFamily>,
	/// §6 `MODEL_RATE_LIMIT`: a requests-per-minute ceiling per family,
	/// parsed as `family:limit` pairs, enforced independently of quota and
	/// of the upstream's own rate limits.
	pub model_rate_limits: HashMap<ModelFamily, u32>,
	/// §4.3/§6 `CHECK_KEYS`: whether the background key checker runs at
	/// all. Defaults to on; disabling it is mostly useful for tests and for
	/// deployments that pre-validate keys out of band.
	pub check_keys: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gatekeeper {
	None,
	ProxyKey,
	UserToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
	Pretty,
	Json,
}

impl Default for Config {
	/// The same defaults `from_env` falls back to with nothing set;
	/// convenient for tests that don't want to touch process-wide env vars.
	fn default() -> Self {
		Config {
			port: 7860,
			gatekeeper: Gatekeeper::None,
			max_ips_per_user: None,
			log_format: LogFormat::Pretty,
			max_context_tokens_openai: None,
			max_context_tokens_anthropic: None,
			max_output_tokens_openai: None,
			max_output_tokens_anthropic: None,
			allowed_vision_services: Vec::new(),
			shared_identifier_limits: std::collections::HashMap::new(),
			dequeue_strategy: DequeueStrategy::default(),
			default_token_quota: HashMap::new(),
			quota_refresh_period: None,
			allowed_model_families: Vec::new(),
			model_rate_limits: HashMap::new(),
			check_keys: true,
		}
	}
}

impl Config {
	pub fn from_env() -> Self {
		Config {
			port: env_parsed("PORT").unwrap_or(7860),
			gatekeeper: match env::var("GATEKEEPER").ok().as_deref() {
				Some("proxy_key") => Gatekeeper::ProxyKey,
				Some("user_token") => Gatekeeper::UserToken,
				_ => Gatekeeper::None,
			},
			max_ips_per_user: env_parsed("MAX_IPS_PER_USER"),
			log_format: match env::var("LOG_FORMAT").ok().as_deref() {
				Some("json") => LogFormat::Json,
				_ => LogFormat::Pretty,
			},
			max_context_tokens_openai: env_parsed("MAX_CONTEXT_TOKENS_OPENAI"),
			max_context_tokens_anthropic: env_parsed("MAX_CONTEXT_TOKENS_ANTHROPIC"),
			max_output_tokens_openai: env_parsed("MAX_OUTPUT_TOKENS_OPENAI"),
			max_output_tokens_anthropic: env_parsed("MAX_OUTPUT_TOKENS_ANTHROPIC"),
			allowed_vision_services: env::var("ALLOWED_VISION_SERVICES")
				.ok()
				.map(|raw| {
					raw
						.split(',')
						.map(str::trim)
						.filter(|s| !s.is_empty())
						.filter_map(parse_service_name)
						.collect()
				})
				.unwrap_or_default(),
			shared_identifier_limits: env::var("SHARED_IDENTIFIER_LIMITS")
				.ok()
				.map(|raw| {
					raw
						.split(',')
						.map(str::trim)
						.filter(|s| !s.is_empty())
						.filter_map(|entry| {
							let (identifier, limit) = entry.split_once(':')?;
							Some((identifier.to_string(), limit.parse().ok()?))
						})
						.collect()
				})
				.unwrap_or_default(),
			dequeue_strategy: match env::var("DEQUEUE_STRATEGY").ok().as_deref() {
				Some("random") => DequeueStrategy::Random,
				_ => DequeueStrategy::Fair,
			},
			default_token_quota: env::var("TOKEN_QUOTA").ok().map(|raw| parse_family_u64_map(&raw)).unwrap_or_default(),
			quota_refresh_period: env_parsed::<u64>("QUOTA_REFRESH_PERIOD").map(Duration::from_secs),
			allowed_model_families: env::var("ALLOWED_MODEL_FAMILIES")
				.ok()
				.map(|raw| {
					raw
						.split(',')
						.map(str::trim)
						.filter(|s| !s.is_empty())
						.filter_map(parse_family_name)
						.collect()
				})
				.unwrap_or_default(),
			model_rate_limits: env::var("MODEL_RATE_LIMIT").ok().map(|raw| parse_family_u32_map(&raw)).unwrap_or_default(),
			check_keys: env::var("CHECK_KEYS").ok().map(|v| v != "false" && v != "0").unwrap_or(true),
		}
	}

	/// §4.5's per-identifier admission cap: 1 unless `identifier` has an
	/// override in `shared_identifier_limits` (e.g. a third-party
	/// aggregator's shared egress IP, which fans many end users through
	/// one address).
	pub fn concurrency_limit(&self, identifier: &str) -> u32 {
		self.shared_identifier_limits.get(identifier).copied().unwrap_or(1)
	}

	/// §4.4 step 6's "configured proxy max" half of the `min(configured,
	/// model max)` context-size calculation, resolved per service family.
	pub fn context_ceiling(&self, service: crate::model::LLMService) -> Option<u64> {
		use crate::model::LLMService::*;
		match service {
			OpenAI | AzureOpenAI => self.max_context_tokens_openai,
			Anthropic | AwsBedrock => self.max_context_tokens_anthropic,
			GoogleAI | Mistral => None,
		}
	}

	pub fn output_ceiling(&self, service: crate::model::LLMService) -> Option<u64> {
		use crate::model::LLMService::*;
		match service {
			OpenAI | AzureOpenAI => self.max_output_tokens_openai,
			Anthropic | AwsBedrock => self.max_output_tokens_anthropic,
			GoogleAI | Mistral => None,
		}
	}

	/// §3/§6: whether `family` is allowed to serve at all in this
	/// deployment. An empty `allowed_model_families` means no restriction.
	pub fn family_allowed(&self, family: ModelFamily) -> bool {
		self.allowed_model_families.is_empty() || self.allowed_model_families.contains(&family)
	}

	/// §6 `MODEL_RATE_LIMIT`: requests-per-minute ceiling for `family`, if
	/// one is configured.
	pub fn model_rate_limit(&self, family: ModelFamily) -> Option<u32> {
		self.model_rate_limits.get(&family).copied()
	}
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
	env::var(name).ok().and_then(|v| v.parse().ok())
}

fn parse_service_name(s: &str) -> Option<crate::model::LLMService> {
	use crate::model::LLMService::*;
	Some(match s {
		"openai" => OpenAI,
		"anthropic" => Anthropic,
		"aws" => AwsBedrock,
		"azure" => AzureOpenAI,
		"google-ai" => GoogleAI,
		"mistral-ai" => Mistral,
		_ => return None,
	})
}

fn parse_family_name(s: &str) -> Option<ModelFamily> {
	use ModelFamily::*;
	Some(match s {
		"turbo" => Turbo,
		"gpt4" => Gpt4,
		"gpt4-32k" => Gpt432k,
		"gpt4-turbo" => Gpt4Turbo,
		"dall-e" => DallE,
		"claude" => Claude,
		"gemini-pro" => GeminiPro,
		"mistral-tiny" => MistralTiny,
		"mistral-small" => MistralSmall,
		"mistral-medium" => MistralMedium,
		"aws-claude" => AwsClaude,
		"azure-turbo" => AzureTurbo,
		"azure-gpt4" => AzureGpt4,
		"azure-gpt4-32k" => AzureGpt432k,
		"azure-gpt4-turbo" => AzureGpt4Turbo,
		_ => return None,
	})
}

fn parse_family_u64_map(raw: &str) -> HashMap<ModelFamily, u64> {
	raw
		.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.filter_map(|entry| {
			let (family, value) = entry.split_once(':')?;
			Some((parse_family_name(family)?, value.parse().ok()?))
		})
		.collect()
}

fn parse_family_u32_map(raw: &str) -> HashMap<ModelFamily, u32> {
	raw
		.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.filter_map(|entry| {
			let (family, value) = entry.split_once(':')?;
			Some((parse_family_name(family)?, value.parse().ok()?))
		})
		.collect()
}

/// Parses `OPENAI_KEY` as a comma-separated list of bearer tokens,
/// optionally suffixed with `:<org-id>` for keys whose organization must be
/// pinned explicitly, and/or a trailing `:trial` marker for keys that have
/// no payment method attached (§4.3 step 3: these are preferred over paid
/// keys when both are otherwise equally eligible, since they draw from
/// separate free quota).
pub fn parse_openai_keys(raw: &str) -> Vec<Key> {
	raw
		.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(|entry| {
			let (entry, is_trial) = match entry.strip_suffix(":trial") {
				Some(rest) => (rest, true),
				None => (entry, false),
			};
			let (key, org) = match entry.split_once(':') {
				Some((k, o)) => (k, Some(o.to_string())),
				None => (entry, None),
			};
			Key::new(Credential::OpenAI { api_key: SecretString::from(key.to_string()), organization_id: org, is_trial })
		})
		.collect()
}

pub fn parse_anthropic_keys(raw: &str) -> Vec<Key> {
	raw
		.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(|key| Key::new(Credential::Anthropic { api_key: SecretString::from(key.to_string()) }))
		.collect()
}

/// Parses `AWS_CREDENTIALS` as a comma-separated list of
/// `accessKeyId:secretAccessKey:region` triples.
pub fn parse_aws_keys(raw: &str) -> Vec<Key> {
	raw
		.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.filter_map(|entry| {
			let mut parts = entry.splitn(3, ':');
			let access_key_id = parts.next()?.to_string();
			let secret_access_key = parts.next()?.to_string();
			let region = parts.next().unwrap_or("us-east-1").to_string();
			Some(Key::new(Credential::AwsBedrock {
				access_key_id,
				secret_access_key: SecretString::from(secret_access_key),
				region,
			}))
		})
		.collect()
}

/// Parses `AZURE_CREDENTIALS` as a comma-separated list of
/// `resourceName:deploymentId:apiKey` triples.
pub fn parse_azure_keys(raw: &str) -> Vec<Key> {
	raw
		.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.filter_map(|entry| {
			let mut parts = entry.splitn(3, ':');
			let resource_name = parts.next()?.to_string();
			let deployment_id = parts.next()?.to_string();
			let api_key = parts.next()?.to_string();
			Some(Key::new(Credential::AzureOpenAI {
				resource_name,
				deployment_id,
				api_key: SecretString::from(api_key),
			}))
		})
		.collect()
}

pub fn parse_google_ai_keys(raw: &str) -> Vec<Key> {
	raw
		.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(|key| Key::new(Credential::GoogleAI { api_key: SecretString::from(key.to_string()) }))
		.collect()
}

pub fn parse_mistral_keys(raw: &str) -> Vec<Key> {
	raw
		.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(|key| Key::new(Credential::Mistral { api_key: SecretString::from(key.to_string()) }))
		.collect()
}

/// GCP service-account JSON blobs are passed base64-encoded in
/// `GCP_CREDENTIALS` so they survive being put in a single-line env var;
/// this just confirms the blob decodes and is valid JSON, since the
/// actual auth flow is handled by `google-cloud-auth` from the decoded
/// bytes at call time rather than up front.
pub fn decode_gcp_credentials(raw: &str) -> Result<Vec<u8>, String> {
	base64::engine::general_purpose::STANDARD
		.decode(raw.trim())
		.map_err(|e| format!("GCP_CREDENTIALS is not valid base64: {e}"))
}

