use super::*;

#[test]
fn parses_comma_separated_openai_keys() {
	let keys = parse_openai_keys("sk-a,sk-b:org-1");
	assert_eq!(keys.len(), 2);
}

#[test]
fn parses_trial_marker_and_org_id_on_openai_keys() {
	let keys = parse_openai_keys("sk-a:trial,sk-b:org-1:trial,sk-c:org-2");
	assert!(keys[0].is_trial());
	match &keys[1].credential {
		Credential::OpenAI { organization_id, is_trial, .. } => {
			assert_eq!(organization_id.as_deref(), Some("org-1"));
			assert!(is_trial);
		},
		_ => panic!("expected OpenAI credential"),
	}
	assert!(!keys[2].is_trial());
}

#[test]
fn parses_aws_triples_with_default_region() {
	let keys = parse_aws_keys("AKIA1:secret1");
	assert_eq!(keys.len(), 1);
	match &keys[0].credential {
		Credential::AwsBedrock { region, .. } => assert_eq!(region, "us-east-1"),
		_ => panic!("expected AwsBedrock credential"),
	}
}

#[test]
fn skips_malformed_azure_entries() {
	let keys = parse_azure_keys("resource-only");
	assert!(keys.is_empty());
}

#[test]
fn context_ceiling_is_per_service_family() {
	let mut config = Config::default();
	config.max_context_tokens_openai = Some(4_096);
	assert_eq!(config.context_ceiling(crate::model::LLMService::OpenAI), Some(4_096));
	assert_eq!(config.context_ceiling(crate::model::LLMService::Anthropic), None);
}

#[test]
fn parses_allowed_vision_services() {
	assert_eq!(
		[parse_service_name("openai"), parse_service_name("azure"), parse_service_name("nonsense")],
		[Some(crate::model::LLMService::OpenAI), Some(crate::model::LLMService::AzureOpenAI), None]
	);
}

#[test]
fn concurrency_limit_defaults_to_one_but_honors_overrides() {
	let mut config = Config::default();
	config.shared_identifier_limits.insert("203.0.113.9".to_string(), 15);
	assert_eq!(config.concurrency_limit("some-user-token"), 1);
	assert_eq!(config.concurrency_limit("203.0.113.9"), 15);
}

#[test]
fn parses_token_quota_map() {
	let quota = parse_family_u64_map("gpt4:100,turbo:50000");
	assert_eq!(quota.get(&crate::model::ModelFamily::Gpt4), Some(&100));
	assert_eq!(quota.get(&crate::model::ModelFamily::Turbo), Some(&50_000));
}

#[test]
fn parses_model_rate_limit_map() {
	let limits = parse_family_u32_map("claude:30");
	let mut config = Config::default();
	config.model_rate_limits = limits;
	assert_eq!(config.model_rate_limit(crate::model::ModelFamily::Claude), Some(30));
	assert_eq!(config.model_rate_limit(crate::model::ModelFamily::Gpt4), None);
}

#[test]
fn family_allowed_is_unrestricted_when_list_is_empty() {
	let config = Config::default();
	assert!(config.family_allowed(crate::model::ModelFamily::Gpt4));
}

#[test]
fn family_allowed_restricts_to_the_configured_set() {
	let mut config = Config::default();
	config.allowed_model_families = vec![crate::model::ModelFamily::Gpt4];
	assert!(config.family_allowed(crate::model::ModelFamily::Gpt4));
	assert!(!config.family_allowed(crate::model::ModelFamily::Claude));
}

#[test]
fn check_keys_defaults_to_enabled() {
	assert!(Config::default().check_keys);
}
