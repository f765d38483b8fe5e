use super::*;
use crate::key::Credential;
use secrecy::SecretString;

fn sample_request() -> openai::ChatCompletionRequest {
	openai::ChatCompletionRequest {
		model: "gpt-4".to_string(),
		messages: vec![openai::Message {
			role: "user".to_string(),
			content: openai::Content::Text("hi".to_string()),
			name: None,
		}],
		max_tokens: None,
		temperature: None,
		top_p: None,
		n: None,
		stream: false,
		stop: None,
		user: None,
	}
}

#[test]
fn rejects_empty_messages() {
	let pool = KeyPool::new();
	let users = UserStore::new();
	users.upsert(crate::user::User::new(relay_core::literal!("tok")));
	let config = Config::default();
	let pipeline = Pipeline::new(&pool, &users, &config);
	let mut request = sample_request();
	request.messages.clear();
	let err = pipeline.process("tok", "1.1.1.1", request).unwrap_err();
	assert!(matches!(err, ProxyError::Validation(_)));
}

#[test]
fn fails_with_no_keys_available() {
	let pool = KeyPool::new();
	let users = UserStore::new();
	users.upsert(crate::user::User::new(relay_core::literal!("tok")));
	let config = Config::default();
	let pipeline = Pipeline::new(&pool, &users, &config);
	let err = pipeline.process("tok", "1.1.1.1", sample_request()).unwrap_err();
	assert!(matches!(err, ProxyError::NoKeysAvailable { .. }));
}

#[test]
fn succeeds_once_a_key_is_registered() {
	let pool = KeyPool::new();
	pool.add_key(crate::key::Key::new(Credential::OpenAI {
		api_key: SecretString::from("sk-test".to_string()),
		organization_id: None,
		is_trial: false,
	}));
	let users = UserStore::new();
	users.upsert(crate::user::User::new(relay_core::literal!("tok")));
	let config = Config::default();
	let pipeline = Pipeline::new(&pool, &users, &config);
	let prepared = pipeline.process("tok", "1.1.1.1", sample_request()).unwrap();
	assert_eq!(prepared.context.family, ModelFamily::Gpt4);
	assert!(prepared.context.key.is_none(), "key selection is deferred to the queue, not done in the pipeline");
}

const TINY_PNG_DATA_URI: &str =
	"data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNk+A8AAQUBAScY42YAAAAASUVORK5CYII=";

fn vision_request(url: &str) -> openai::ChatCompletionRequest {
	let mut request = sample_request();
	request.messages = vec![openai::Message {
		role: "user".to_string(),
		content: openai::Content::Parts(vec![
			openai::ContentPart::Text { text: "what's in this image?".to_string() },
			openai::ContentPart::ImageUrl { image_url: openai::ImageUrl { url: url.to_string(), detail: None } },
		]),
		name: None,
	}];
	request
}

#[test]
fn max_tokens_is_clamped_to_the_configured_output_ceiling() {
	let pool = KeyPool::new();
	pool.add_key(crate::key::Key::new(Credential::OpenAI {
		api_key: SecretString::from("sk-test".to_string()),
		organization_id: None,
		is_trial: false,
	}));
	let users = UserStore::new();
	users.upsert(crate::user::User::new(relay_core::literal!("tok")));
	let mut config = Config::default();
	config.max_output_tokens_openai = Some(256);
	let pipeline = Pipeline::new(&pool, &users, &config);
	let mut request = sample_request();
	request.max_tokens = Some(4096);
	let prepared = pipeline.process("tok", "1.1.1.1", request).unwrap();
	assert_eq!(prepared.context.max_output_tokens, 256);
}

#[test]
fn context_too_large_is_rejected() {
	let pool = KeyPool::new();
	pool.add_key(crate::key::Key::new(Credential::OpenAI {
		api_key: SecretString::from("sk-test".to_string()),
		organization_id: None,
		is_trial: false,
	}));
	let users = UserStore::new();
	users.upsert(crate::user::User::new(relay_core::literal!("tok")));
	let mut config = Config::default();
	config.max_context_tokens_openai = Some(1);
	let pipeline = Pipeline::new(&pool, &users, &config);
	let err = pipeline.process("tok", "1.1.1.1", sample_request()).unwrap_err();
	assert!(matches!(err, ProxyError::ContextTooLarge(_)));
}

#[test]
fn vision_request_rejected_when_service_is_not_allowlisted() {
	let pool = KeyPool::new();
	pool.add_key(crate::key::Key::new(Credential::OpenAI {
		api_key: SecretString::from("sk-test".to_string()),
		organization_id: None,
		is_trial: false,
	}));
	let users = UserStore::new();
	users.upsert(crate::user::User::new(relay_core::literal!("tok")));
	let config = Config::default();
	let pipeline = Pipeline::new(&pool, &users, &config);
	let err = pipeline.process("tok", "1.1.1.1", vision_request(TINY_PNG_DATA_URI)).unwrap_err();
	assert!(matches!(err, ProxyError::Validation(_)));
}

#[test]
fn vision_request_succeeds_once_service_is_allowlisted() {
	let pool = KeyPool::new();
	pool.add_key(crate::key::Key::new(Credential::OpenAI {
		api_key: SecretString::from("sk-test".to_string()),
		organization_id: None,
		is_trial: false,
	}));
	let users = UserStore::new();
	users.upsert(crate::user::User::new(relay_core::literal!("tok")));
	let mut config = Config::default();
	config.allowed_vision_services = vec![LLMService::OpenAI];
	let pipeline = Pipeline::new(&pool, &users, &config);
	let prepared = pipeline.process("tok", "1.1.1.1", vision_request(TINY_PNG_DATA_URI)).unwrap();
	assert!(prepared.context.prompt_tokens_estimate > 0);
}

#[test]
fn vision_request_with_a_remote_url_is_rejected_even_when_allowlisted() {
	let pool = KeyPool::new();
	pool.add_key(crate::key::Key::new(Credential::OpenAI {
		api_key: SecretString::from("sk-test".to_string()),
		organization_id: None,
		is_trial: false,
	}));
	let users = UserStore::new();
	users.upsert(crate::user::User::new(relay_core::literal!("tok")));
	let mut config = Config::default();
	config.allowed_vision_services = vec![LLMService::OpenAI];
	let pipeline = Pipeline::new(&pool, &users, &config);
	let err = pipeline.process("tok", "1.1.1.1", vision_request("https://example.com/cat.png")).unwrap_err();
	assert!(matches!(err, ProxyError::Validation(_)));
}

#[test]
fn vision_request_bypasses_the_allowlist_for_special_users() {
	let pool = KeyPool::new();
	pool.add_key(crate::key::Key::new(Credential::OpenAI {
		api_key: SecretString::from("sk-test".to_string()),
		organization_id: None,
		is_trial: false,
	}));
	let users = UserStore::new();
	let mut user = crate::user::User::new(relay_core::literal!("tok"));
	user.user_type = crate::user::UserType::Special;
	users.upsert(user);
	let config = Config::default();
	let pipeline = Pipeline::new(&pool, &users, &config);
	assert!(pipeline.process("tok", "1.1.1.1", vision_request(TINY_PNG_DATA_URI)).is_ok());
}

#[test]
fn succeeds_even_when_the_only_key_is_currently_rate_limited() {
	// Key selection is late-bound at dequeue time (§9), so a family
	// whose sole key is temporarily locked out should still be
	// admitted to the queue rather than rejected up front.
	let pool = KeyPool::new();
	pool.add_key(crate::key::Key::new(Credential::OpenAI {
		api_key: SecretString::from("sk-test".to_string()),
		organization_id: None,
		is_trial: false,
	}));
	let handle = pool.get(ModelFamily::Gpt4).unwrap();
	pool.mark_rate_limited(&handle, std::time::Duration::from_secs(60), None);
	let users = UserStore::new();
	users.upsert(crate::user::User::new(relay_core::literal!("tok")));
	let config = Config::default();
	let pipeline = Pipeline::new(&pool, &users, &config);
	let prepared = pipeline.process("tok", "1.1.1.1", sample_request()).unwrap();
	assert_eq!(prepared.context.family, ModelFamily::Gpt4);
}
