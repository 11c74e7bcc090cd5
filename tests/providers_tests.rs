//! External tests for the providers module: Gemini wire types, serialization
//! and display implementations.

use chat_relay::providers::*;

// -- SafetyThreshold ----------------------------------------------------------

#[test]
fn test_safety_threshold_default_is_medium() {
    assert_eq!(SafetyThreshold::default(), SafetyThreshold::BlockMediumAndAbove);
}

#[test]
fn test_safety_threshold_display() {
    assert_eq!(SafetyThreshold::BlockNone.to_string(), "BLOCK_NONE");
    assert_eq!(SafetyThreshold::BlockLowAndAbove.to_string(), "BLOCK_LOW_AND_ABOVE");
}

#[test]
fn test_safety_threshold_deserializes_from_wire_name() {
    let t: SafetyThreshold = serde_json::from_str("\"BLOCK_ONLY_HIGH\"").unwrap();
    assert_eq!(t, SafetyThreshold::BlockOnlyHigh);
}

#[test]
fn test_harm_categories_are_the_four_configurable_ones() {
    assert_eq!(HARM_CATEGORIES.len(), 4);
    assert!(HARM_CATEGORIES.iter().all(|c| c.starts_with("HARM_CATEGORY_")));
}

// -- Request ------------------------------------------------------------------

#[test]
fn test_request_without_system_instruction_omits_field() {
    let req = GenerateContentRequest {
        contents: vec![Content::user(vec![Part::text("hi")])],
        system_instruction: None,
        generation_config: GenerationConfig { temperature: 0.7, max_output_tokens: 1024 },
        safety_settings: safety_settings(SafetyThreshold::default()),
    };
    let json = serde_json::to_string(&req).unwrap();
    assert!(!json.contains("systemInstruction"));
    assert!(json.contains("\"temperature\":0.7"));
}

#[test]
fn test_history_roles_serialize_in_order() {
    let req = GenerateContentRequest {
        contents: vec![
            Content::user(vec![Part::text("a")]),
            Content::model(vec![Part::text("b")]),
            Content::user(vec![Part::text("c")]),
        ],
        system_instruction: None,
        generation_config: GenerationConfig { temperature: 0.0, max_output_tokens: 1 },
        safety_settings: vec![],
    };
    let v = serde_json::to_value(&req).unwrap();
    let roles: Vec<&str> = v["contents"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, ["user", "model", "user"]);
}

#[test]
fn test_inline_data_part_shape() {
    let v = serde_json::to_value(Part::inline_data("image/jpeg", "AAAA")).unwrap();
    assert_eq!(v, serde_json::json!({"inlineData": {"mimeType": "image/jpeg", "data": "AAAA"}}));
}

// -- Response -----------------------------------------------------------------

#[test]
fn test_empty_object_response_has_no_candidates() {
    let resp: GenerateContentResponse = serde_json::from_str("{}").unwrap();
    assert!(resp.candidates.is_empty());
    assert!(resp.prompt_feedback.is_none());
}

#[test]
fn test_candidate_without_content_deserializes() {
    let resp: GenerateContentResponse =
        serde_json::from_str(r#"{"candidates":[{"finishReason":"SAFETY","safetyRatings":[]}]}"#).unwrap();
    assert!(resp.candidates[0].content.is_none());
    assert_eq!(resp.candidates[0].finish_reason.as_deref(), Some("SAFETY"));
}

#[test]
fn test_unknown_fields_are_ignored() {
    let json = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"x","thought":false}]},"index":0}],"usageMetadata":{"totalTokenCount":3},"modelVersion":"gemini-1.5-flash"}"#;
    let resp: GenerateContentResponse = serde_json::from_str(json).unwrap();
    assert_eq!(resp.candidates.len(), 1);
}

#[test]
fn test_api_error_without_status_defaults() {
    let env: ApiErrorEnvelope = serde_json::from_str(r#"{"error":{"message":"bad key"}}"#).unwrap();
    assert_eq!(env.error.code, 0);
    assert_eq!(env.error.status, "");
    assert_eq!(env.error.message, "bad key");
}

#[test]
fn test_models_list_missing_methods_is_unsupported() {
    let resp: ListModelsResponse = serde_json::from_str(r#"{"models":[{"name":"models/x"}]}"#).unwrap();
    assert!(!resp.models[0].supports_generate_content());
    assert!(resp.models[0].display_name.is_none());
}
