//! Capability registry behavior across real adapter registrations.
//!
//! These tests go through the public constructors: building an adapter
//! registers its models' descriptors with the process-wide registry.

use std::collections::HashMap;

use polyllm::capabilities::{
    registry, Capability, FunctionCallingConfig, StructuredResponseConfig, VisionConfig,
};
use polyllm::providers::{
    AnthropicProvider, CohereProvider, OpenAiProvider, Provider, COHERE, OPENAI,
};

fn openai(model: &str) -> OpenAiProvider {
    OpenAiProvider::new("key", model, HashMap::new())
}

#[test]
fn provider_capability_matrix() {
    let cases: [(Box<dyn Provider>, Capability, bool); 6] = [
        (
            Box::new(CohereProvider::new("key", "command-r-plus", HashMap::new())),
            Capability::StructuredResponse,
            true,
        ),
        (Box::new(openai("gpt-4o")), Capability::Vision, true),
        (
            Box::new(openai("o1-preview")),
            Capability::FunctionCalling,
            false,
        ),
        (
            Box::new(openai("o1-preview")),
            Capability::StructuredResponse,
            false,
        ),
        (
            Box::new(openai("gpt-3.5-turbo")),
            Capability::FunctionCalling,
            true,
        ),
        (
            Box::new(CohereProvider::new("key", "command-r", HashMap::new())),
            Capability::Streaming,
            true,
        ),
    ];

    for (provider, capability, expected) in cases {
        assert_eq!(
            provider.has_capability(capability, None),
            expected,
            "{} / {capability}",
            provider.name(),
        );
    }
}

#[test]
fn cohere_structured_response_quirk() {
    let provider = CohereProvider::new("key", "command-r-plus", HashMap::new());
    assert!(provider.has_capability(Capability::StructuredResponse, None));

    let cfg: StructuredResponseConfig = registry()
        .get_typed(COHERE, "command-r-plus")
        .expect("descriptor should be registered");
    assert!(cfg.requires_tool_use);
    assert!(!cfg.system_prompt_hint.is_empty());
}

#[test]
fn openai_vision_descriptor_details() {
    let provider = openai("gpt-4o");
    assert!(provider.has_capability(Capability::Vision, None));

    let vision: VisionConfig = registry()
        .get_typed(OPENAI, "gpt-4o")
        .expect("vision descriptor should be registered");
    assert_eq!(vision.max_image_size, 20 * 1024 * 1024);
    assert_eq!(vision.max_images_per_request, 10);
    assert!(vision.supports_video_frames);
}

#[test]
fn openai_model_specific_capabilities() {
    let cases = [
        ("gpt-4o", Capability::Vision, true),
        ("gpt-4-turbo", Capability::Vision, true),
        ("gpt-3.5-turbo", Capability::Vision, false),
        ("o1-preview", Capability::FunctionCalling, false),
        ("o1-preview", Capability::StructuredResponse, false),
        ("gpt-3.5-turbo-0125", Capability::StructuredResponse, true),
    ];
    for (model, capability, expected) in cases {
        let provider = openai(model);
        assert_eq!(
            provider.has_capability(capability, None),
            expected,
            "{model} / {capability}"
        );
    }
}

#[test]
fn function_calling_descriptors_scale_by_model() {
    openai("gpt-4");
    openai("gpt-3.5-turbo");
    CohereProvider::new("key", "command-r", HashMap::new());

    let gpt4: FunctionCallingConfig = registry().get_typed(OPENAI, "gpt-4").unwrap();
    assert_eq!(gpt4.max_functions, 128);
    assert!(gpt4.supports_parallel);

    let gpt35: FunctionCallingConfig = registry().get_typed(OPENAI, "gpt-3.5-turbo").unwrap();
    assert_eq!(gpt35.max_functions, 64);

    let cohere: FunctionCallingConfig = registry().get_typed(COHERE, "command-r").unwrap();
    assert!(!cohere.supports_parallel);
    assert!(cohere.requires_tool_role);
}

#[test]
fn registry_is_a_process_singleton() {
    assert!(std::ptr::eq(registry(), registry()));

    // Registration through one construction path is visible everywhere.
    AnthropicProvider::new("key", "claude-3-opus", HashMap::new());
    assert!(registry().has_capability("anthropic", "claude-3-opus", Capability::Streaming));
}

#[test]
fn model_override_changes_the_answer() {
    let provider = openai("gpt-4o");
    assert!(provider.has_capability(Capability::Vision, None));
    assert!(!provider.has_capability(Capability::Vision, Some("gpt-3.5-turbo")));
    assert!(!provider.has_capability(Capability::FunctionCalling, Some("o1-preview")));
}
