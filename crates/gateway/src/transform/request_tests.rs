use super::*;

fn sample_request() -> openai::ChatCompletionRequest {
	openai::ChatCompletionRequest {
		model: "claude-3-opus".to_string(),
		messages: vec![
			openai::Message { role: "system".to_string(), content: openai::Content::Text("be terse".to_string()), name: None },
			openai::Message { role: "user".to_string(), content: openai::Content::Text("hi".to_string()), name: None },
		],
		max_tokens: Some(256),
		temperature: Some(0.5),
		top_p: None,
		n: None,
		stream: false,
		stop: None,
		user: None,
	}
}

#[test]
fn anthropic_translation_pulls_system_out() {
	let value = translate_request(LLMService::Anthropic, &sample_request()).unwrap();
	assert_eq!(value["system"], "be terse");
	assert_eq!(value["messages"].as_array().unwrap().len(), 1);
}

#[test]
fn google_ai_translation_maps_assistant_to_model_role() {
	let mut request = sample_request();
	request.messages.push(openai::Message { role: "assistant".to_string(), content: openai::Content::Text("hello".to_string()), name: None });
	let value = translate_request(LLMService::GoogleAI, &request).unwrap();
	let contents = value["contents"].as_array().unwrap();
	assert_eq!(contents[1]["role"], "model");
}

#[test]
fn mistral_translation_is_near_passthrough() {
	let value = translate_request(LLMService::Mistral, &sample_request()).unwrap();
	assert_eq!(value["messages"][1]["content"], "hi");
}

#[test]
fn mistral_translation_coalesces_consecutive_same_role_messages() {
	let mut request = sample_request();
	request.messages.push(openai::Message { role: "user".to_string(), content: openai::Content::Text("again".to_string()), name: None });
	let value = translate_request(LLMService::Mistral, &request).unwrap();
	let messages = value["messages"].as_array().unwrap();
	assert_eq!(messages.len(), 2, "the two consecutive user turns must merge into one");
	assert_eq!(messages[1]["content"], "hi\n\nagain");
}

#[test]
fn anthropic_messages_translation_coalesces_and_trims_trailing_assistant() {
	let mut request = sample_request();
	request.messages.push(openai::Message { role: "user".to_string(), content: openai::Content::Text("again".to_string()), name: None });
	request.messages.push(openai::Message { role: "assistant".to_string(), content: openai::Content::Text("ok  \n".to_string()), name: None });
	let value = translate_request(LLMService::Anthropic, &request).unwrap();
	let messages = value["messages"].as_array().unwrap();
	assert_eq!(messages.len(), 2, "the two consecutive user turns must merge into one");
	assert_eq!(messages[0]["content"], "hi\n\nagain");
	assert_eq!(messages[1]["content"], "ok");
}

#[test]
fn anthropic_text_translation_includes_the_fixed_stop_sequences() {
	let prepared = to_anthropic_text(&sample_request(), false).unwrap();
	assert_eq!(
		prepared.stop_sequences.as_deref(),
		Some(["\n\nHuman:".to_string(), "\n\nSystem:".to_string()].as_slice())
	);
}

#[test]
fn google_ai_translation_sets_block_none_safety_settings() {
	let value = translate_request(LLMService::GoogleAI, &sample_request()).unwrap();
	let settings = value["safety_settings"].as_array().unwrap();
	assert_eq!(settings.len(), 4);
	assert!(settings.iter().all(|s| s["threshold"] == "BLOCK_NONE"));
}

#[test]
fn google_ai_translation_detects_character_name_prefixes_as_stop_sequences() {
	let mut request = sample_request();
	request.messages.push(openai::Message {
		role: "user".to_string(),
		content: openai::Content::Text("Alice: hello there\nBob: hi".to_string()),
		name: None,
	});
	let value = translate_request(LLMService::GoogleAI, &request).unwrap();
	let stops = value["generation_config"]["stop_sequences"].as_array().unwrap();
	let stops: Vec<&str> = stops.iter().map(|s| s.as_str().unwrap()).collect();
	assert!(stops.contains(&"Alice:"));
	assert!(stops.contains(&"Bob:"));
}

#[test]
fn openai_text_translation_flattens_messages_and_appends_the_user_stop() {
	let prepared = to_openai_text(&sample_request()).unwrap();
	assert_eq!(prepared.prompt, "System: be terse\n\nUser: hi\n\nAssistant:");
	assert_eq!(prepared.stop.as_deref(), Some(["\n\nUser:".to_string()].as_slice()));
}

#[test]
fn openai_image_translation_requires_the_image_marker() {
	let mut request = sample_request();
	request.messages.push(openai::Message {
		role: "user".to_string(),
		content: openai::Content::Text("a cat wearing a hat".to_string()),
		name: None,
	});
	let err = to_openai_image(&request).unwrap_err();
	assert!(matches!(err, ProxyError::Validation(_)));
}

#[test]
fn openai_image_translation_uses_the_last_user_message_after_the_marker() {
	let mut request = sample_request();
	request.messages.push(openai::Message {
		role: "user".to_string(),
		content: openai::Content::Text("Image: a cat wearing a hat".to_string()),
		name: None,
	});
	let prepared = to_openai_image(&request).unwrap();
	assert_eq!(prepared.prompt, "a cat wearing a hat");
}

#[test]
fn openai_image_translation_rejects_streaming() {
	let mut request = sample_request();
	request.stream = true;
	request.messages.push(openai::Message {
		role: "user".to_string(),
		content: openai::Content::Text("Image: a cat wearing a hat".to_string()),
		name: None,
	});
	assert!(matches!(to_openai_image(&request), Err(ProxyError::Validation(_))));
}
