//! 能力注册表 — 进程级 (provider, model) → 描述符目录，读多写少。
//!
//! Process-wide capability registry. Adapters register descriptors during
//! construction; every request-preparation path reads from here to reject
//! unsupported requests before any network traffic.
//!
//! Writers are expected during single-threaded initialization, but the map is
//! guarded so concurrent registration cannot corrupt it and readers are
//! always safe. Lookups on absent keys are not errors; only the typed
//! retrieval path reports `CapabilityNotFound` / `DescriptorTypeMismatch`.

use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::error::Error;
use crate::Result;

use super::{Capability, CapabilityConfig, Descriptor};

static GLOBAL: Lazy<CapabilityRegistry> = Lazy::new(CapabilityRegistry::new);

/// The process-wide registry instance, created lazily on first access.
pub fn registry() -> &'static CapabilityRegistry {
    &GLOBAL
}

/// (provider, model) → {capability → descriptor} catalog.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<String, HashMap<Capability, CapabilityConfig>>>,
}

impl CapabilityRegistry {
    /// A private registry, for dependency-injection style tests. Production
    /// code goes through [`registry()`].
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn make_key(provider: &str, model: &str) -> String {
        format!("{provider}:{model}")
    }

    /// Store a descriptor; the last writer wins for the same
    /// (provider, model, capability) triple.
    pub fn register(
        &self,
        provider: &str,
        model: &str,
        capability: Capability,
        config: CapabilityConfig,
    ) {
        let key = Self::make_key(provider, model);
        let mut entries = self.entries.write().expect("capability registry poisoned");
        entries.entry(key).or_default().insert(capability, config);
    }

    pub fn has_capability(&self, provider: &str, model: &str, capability: Capability) -> bool {
        let key = Self::make_key(provider, model);
        let entries = self.entries.read().expect("capability registry poisoned");
        entries
            .get(&key)
            .map(|caps| caps.contains_key(&capability))
            .unwrap_or(false)
    }

    /// Descriptor lookup; `None` when the key or capability is absent.
    pub fn get_config(
        &self,
        provider: &str,
        model: &str,
        capability: Capability,
    ) -> Option<CapabilityConfig> {
        let key = Self::make_key(provider, model);
        let entries = self.entries.read().expect("capability registry poisoned");
        entries.get(&key).and_then(|caps| caps.get(&capability)).cloned()
    }

    /// Typed retrieval: the descriptor kind is inferred from `T`.
    pub fn get_typed<T: Descriptor>(&self, provider: &str, model: &str) -> Result<T> {
        let config = self
            .get_config(provider, model, T::CAPABILITY)
            .ok_or_else(|| Error::CapabilityNotFound {
                provider: provider.to_string(),
                model: model.to_string(),
                capability: T::CAPABILITY,
            })?;
        let actual = config.capability();
        T::from_config(config).ok_or(Error::DescriptorTypeMismatch {
            expected: T::CAPABILITY,
            actual,
        })
    }

    /// Purge every entry. Testing only.
    pub fn clear(&self) {
        self.entries
            .write()
            .expect("capability registry poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{StreamingConfig, StructuredResponseConfig};

    fn streaming() -> CapabilityConfig {
        CapabilityConfig::Streaming(StreamingConfig {
            chunk_delimiter: "data: ".into(),
            buffer_size: 4096,
            supports_sse: true,
            supports_usage: true,
        })
    }

    #[test]
    fn lookup_tracks_registration() {
        let reg = CapabilityRegistry::new();
        assert!(!reg.has_capability("openai", "gpt-4", Capability::Streaming));
        reg.register("openai", "gpt-4", Capability::Streaming, streaming());
        assert!(reg.has_capability("openai", "gpt-4", Capability::Streaming));
        assert!(reg
            .get_config("openai", "gpt-4", Capability::Streaming)
            .is_some());
    }

    #[test]
    fn has_capability_iff_config_present() {
        let reg = CapabilityRegistry::new();
        reg.register("a", "m", Capability::Streaming, streaming());
        for cap in [
            Capability::Streaming,
            Capability::StructuredResponse,
            Capability::Vision,
        ] {
            assert_eq!(
                reg.has_capability("a", "m", cap),
                reg.get_config("a", "m", cap).is_some()
            );
        }
    }

    #[test]
    fn last_writer_wins() {
        let reg = CapabilityRegistry::new();
        reg.register("p", "m", Capability::Streaming, streaming());
        let replacement = StreamingConfig {
            chunk_delimiter: "\n".into(),
            buffer_size: 8192,
            supports_sse: false,
            supports_usage: false,
        };
        reg.register(
            "p",
            "m",
            Capability::Streaming,
            CapabilityConfig::Streaming(replacement.clone()),
        );
        let got: StreamingConfig = reg.get_typed("p", "m").unwrap();
        assert_eq!(got, replacement);
    }

    #[test]
    fn typed_retrieval_errors() {
        let reg = CapabilityRegistry::new();
        let err = reg
            .get_typed::<StreamingConfig>("none", "missing")
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityNotFound { .. }));

        reg.register("p", "m", Capability::Streaming, streaming());
        let got: StreamingConfig = reg.get_typed("p", "m").unwrap();
        assert!(got.supports_sse);
        // Asking for a different descriptor type on the same key misses.
        assert!(matches!(
            reg.get_typed::<StructuredResponseConfig>("p", "m"),
            Err(Error::CapabilityNotFound { .. })
        ));
    }

    #[test]
    fn clear_empties_everything() {
        let reg = CapabilityRegistry::new();
        reg.register("p", "m", Capability::Streaming, streaming());
        reg.clear();
        assert!(!reg.has_capability("p", "m", Capability::Streaming));
    }

    #[test]
    fn concurrent_readers_during_writes() {
        use std::sync::Arc;

        let reg = Arc::new(CapabilityRegistry::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let reg = Arc::clone(&reg);
            handles.push(std::thread::spawn(move || {
                for j in 0..100 {
                    let model = format!("m{}", j % 10);
                    if i % 2 == 0 {
                        reg.register("p", &model, Capability::Streaming, streaming());
                    } else {
                        let _ = reg.has_capability("p", &model, Capability::Streaming);
                        let _ = reg.get_config("p", &model, Capability::Streaming);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
