//! 能力描述系统 — 按 (provider, model) 声明各厂商特性的密封描述符集合。
//!
//! Capability descriptor system. Each feature a (provider, model) pair may
//! support is described by one variant of the sealed [`CapabilityConfig`]
//! union; adapters register descriptors at construction time and consult the
//! [registry](crate::capabilities::registry) before hitting the network.

pub mod registry;

pub use registry::{registry, CapabilityRegistry};

use serde::{Deserialize, Serialize};

/// Closed set of capability tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    StructuredResponse,
    Streaming,
    FunctionCalling,
    Vision,
    ToolUse,
    SystemPrompt,
    Caching,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::StructuredResponse => "structured_response",
            Capability::Streaming => "streaming",
            Capability::FunctionCalling => "function_calling",
            Capability::Vision => "vision",
            Capability::ToolUse => "tool_use",
            Capability::SystemPrompt => "system_prompt",
            Capability::Caching => "caching",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire formats a structured response may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    Json,
    Plain,
}

/// JSON Schema value kinds accepted by a vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaType {
    Object,
    Array,
    String,
    Number,
    Boolean,
}

/// Image formats accepted by a vision-capable model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
}

/// How structured responses work for a model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredResponseConfig {
    /// Structured output is only reachable through tool calling (Cohere).
    pub requires_tool_use: bool,
    pub requires_json_mode: bool,
    pub max_schema_depth: u32,
    pub max_properties: u32,
    pub supported_formats: Vec<DataFormat>,
    pub supported_types: Vec<SchemaType>,
    /// Instruction text adapters may fold into the system prompt.
    pub system_prompt_hint: String,
}

/// Function-calling limits and behavior.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallingConfig {
    pub max_functions: u32,
    pub max_parallel_calls: u32,
    pub supports_parallel: bool,
    pub requires_tool_role: bool,
    pub supports_streaming: bool,
    pub supported_parameter_types: Vec<SchemaType>,
    pub max_nesting_depth: u32,
}

/// Streaming transport behavior.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub chunk_delimiter: String,
    pub buffer_size: usize,
    pub supports_sse: bool,
    /// Whether usage counts are reported on stream frames.
    pub supports_usage: bool,
}

/// Image-input limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisionConfig {
    pub max_image_size: u64,
    pub max_images_per_request: u32,
    pub supported_formats: Vec<ImageFormat>,
    pub supports_video_frames: bool,
    pub supports_ocr: bool,
    pub supports_image_generation: bool,
    pub supports_object_detection: bool,
}

/// Prompt-caching behavior.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachingConfig {
    pub cache_key_strategy: String,
    pub max_cache_size: u64,
    pub cache_ttl_seconds: u64,
}

/// System-prompt handling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemPromptConfig {
    pub max_length: usize,
    /// Whether the vendor accepts more than one system segment.
    pub supports_multiple: bool,
}

/// Sealed union of capability descriptors, one variant per capability kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "capability", rename_all = "snake_case")]
pub enum CapabilityConfig {
    StructuredResponse(StructuredResponseConfig),
    FunctionCalling(FunctionCallingConfig),
    Streaming(StreamingConfig),
    Vision(VisionConfig),
    Caching(CachingConfig),
    SystemPrompt(SystemPromptConfig),
}

impl CapabilityConfig {
    /// The capability tag this descriptor belongs to.
    pub fn capability(&self) -> Capability {
        match self {
            CapabilityConfig::StructuredResponse(_) => Capability::StructuredResponse,
            CapabilityConfig::FunctionCalling(_) => Capability::FunctionCalling,
            CapabilityConfig::Streaming(_) => Capability::Streaming,
            CapabilityConfig::Vision(_) => Capability::Vision,
            CapabilityConfig::Caching(_) => Capability::Caching,
            CapabilityConfig::SystemPrompt(_) => Capability::SystemPrompt,
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::StructuredResponseConfig {}
    impl Sealed for super::FunctionCallingConfig {}
    impl Sealed for super::StreamingConfig {}
    impl Sealed for super::VisionConfig {}
    impl Sealed for super::CachingConfig {}
    impl Sealed for super::SystemPromptConfig {}
}

/// Typed view over [`CapabilityConfig`] variants, used by
/// [`CapabilityRegistry::get_typed`]. The type itself determines which
/// capability is fetched.
pub trait Descriptor: sealed::Sealed + Sized {
    const CAPABILITY: Capability;

    fn from_config(config: CapabilityConfig) -> Option<Self>;
}

impl Descriptor for StructuredResponseConfig {
    const CAPABILITY: Capability = Capability::StructuredResponse;

    fn from_config(config: CapabilityConfig) -> Option<Self> {
        match config {
            CapabilityConfig::StructuredResponse(c) => Some(c),
            _ => None,
        }
    }
}

impl Descriptor for FunctionCallingConfig {
    const CAPABILITY: Capability = Capability::FunctionCalling;

    fn from_config(config: CapabilityConfig) -> Option<Self> {
        match config {
            CapabilityConfig::FunctionCalling(c) => Some(c),
            _ => None,
        }
    }
}

impl Descriptor for StreamingConfig {
    const CAPABILITY: Capability = Capability::Streaming;

    fn from_config(config: CapabilityConfig) -> Option<Self> {
        match config {
            CapabilityConfig::Streaming(c) => Some(c),
            _ => None,
        }
    }
}

impl Descriptor for VisionConfig {
    const CAPABILITY: Capability = Capability::Vision;

    fn from_config(config: CapabilityConfig) -> Option<Self> {
        match config {
            CapabilityConfig::Vision(c) => Some(c),
            _ => None,
        }
    }
}

impl Descriptor for CachingConfig {
    const CAPABILITY: Capability = Capability::Caching;

    fn from_config(config: CapabilityConfig) -> Option<Self> {
        match config {
            CapabilityConfig::Caching(c) => Some(c),
            _ => None,
        }
    }
}

impl Descriptor for SystemPromptConfig {
    const CAPABILITY: Capability = Capability::SystemPrompt;

    fn from_config(config: CapabilityConfig) -> Option<Self> {
        match config {
            CapabilityConfig::SystemPrompt(c) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_reports_its_capability() {
        let cfg = CapabilityConfig::Streaming(StreamingConfig {
            chunk_delimiter: "data: ".into(),
            buffer_size: 4096,
            supports_sse: true,
            supports_usage: true,
        });
        assert_eq!(cfg.capability(), Capability::Streaming);
    }

    #[test]
    fn capability_tags_serialize_snake_case() {
        let json = serde_json::to_value(Capability::StructuredResponse).unwrap();
        assert_eq!(json, "structured_response");
        assert_eq!(Capability::FunctionCalling.to_string(), "function_calling");
    }

    #[test]
    fn descriptor_extraction_rejects_wrong_variant() {
        let cfg = CapabilityConfig::Caching(CachingConfig::default());
        assert!(StreamingConfig::from_config(cfg.clone()).is_none());
        assert!(CachingConfig::from_config(cfg).is_some());
    }
}
