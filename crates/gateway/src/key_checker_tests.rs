use super::*;

#[test]
fn check_period_matches_spec_values_for_anthropic_and_openai() {
	assert_eq!(check_period(LLMService::Anthropic), Duration::from_secs(60 * 60));
	assert_eq!(check_period(LLMService::OpenAI), Duration::from_secs(5 * 60));
}

#[test]
fn batch_size_matches_spec_values_for_anthropic_and_openai() {
	assert_eq!(batch_size(LLMService::Anthropic), 6);
	assert_eq!(batch_size(LLMService::OpenAI), 12);
}

#[test]
fn logging_config_enabled_if_any_delivery_stream_is_on() {
	let config = LoggingConfig {
		text_data_delivery_enabled: Some(false),
		image_data_delivery_enabled: Some(true),
		embedding_data_delivery_enabled: None,
	};
	assert!(config.is_enabled());
}

#[test]
fn logging_config_disabled_when_every_stream_is_off_or_absent() {
	let config = LoggingConfig { text_data_delivery_enabled: Some(false), image_data_delivery_enabled: None, embedding_data_delivery_enabled: None };
	assert!(!config.is_enabled());
}
