//! Per-call block options

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::stream::StreamRole;

/// Options threaded through every block call
///
/// Loaded from JSON with missing keys taking their defaults:
///
/// ```json
/// { "union_cond_attn": true, "add_cond_attn": false, "latent_lora": false, "independent_condition": false }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockOptions {
    /// Condition and non-condition tokens see each other in both directions
    pub union_cond_attn: bool,
    /// Also add the gated condition attention outputs into the main residual
    pub add_cond_attn: bool,
    /// Keep adapters active on the main stream's projections
    pub latent_lora: bool,
    /// Condition tokens may not attend to non-condition tokens
    pub independent_condition: bool,
}

impl Default for BlockOptions {
    fn default() -> Self {
        Self {
            union_cond_attn: true,
            add_cond_attn: false,
            latent_lora: false,
            independent_condition: false,
        }
    }
}

impl BlockOptions {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Whether adapters contribute to projections applied to `role`
    ///
    /// Main-stream adapters stay off unless `latent_lora` is set; every other
    /// stream keeps whatever state the scope is in.
    pub fn adapters_enabled(&self, role: StreamRole) -> bool {
        role != StreamRole::Main || self.latent_lora
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_keep_union_attention() {
        let options = BlockOptions::default();
        assert!(options.union_cond_attn);
        assert!(!options.add_cond_attn);
        assert!(!options.latent_lora);
        assert!(!options.independent_condition);
    }

    #[test]
    fn test_adapters_off_for_main_by_default() {
        let options = BlockOptions::default();
        assert!(!options.adapters_enabled(StreamRole::Main));
        assert!(options.adapters_enabled(StreamRole::Context));

        let latent = BlockOptions {
            latent_lora: true,
            ..Default::default()
        };
        assert!(latent.adapters_enabled(StreamRole::Main));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let options = BlockOptions::from_json_str(r#"{ "latent_lora": true }"#).unwrap();
        assert!(options.latent_lora);
        assert!(options.union_cond_attn);
    }

    #[test]
    fn test_json_roundtrip_through_file() {
        let options = BlockOptions {
            union_cond_attn: false,
            independent_condition: true,
            ..Default::default()
        };
        let path = std::env::temp_dir().join(format!("block-options-{}.json", std::process::id()));
        std::fs::write(&path, options.to_json_string().unwrap()).unwrap();

        let loaded = BlockOptions::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, options);
    }

    #[test]
    fn test_errors_are_typed() {
        assert!(matches!(
            BlockOptions::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            BlockOptions::from_file("/nonexistent/block-options.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
