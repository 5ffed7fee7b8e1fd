//! Version information for pipelink.

use serde::{Deserialize, Serialize};

/// Pipelink version from Cargo.toml
pub const PIPELINK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported on `/healthcheck`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub pipelink: String,
    /// Name of the compute stage this node runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            pipelink: PIPELINK_VERSION.to_string(),
            stage: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.pipelink, PIPELINK_VERSION);
        assert!(info.stage.is_none());
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            pipelink: "0.1.0".to_string(),
            stage: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "pipelink": "0.1.0"
        }
        "#);
    }

    #[test]
    fn version_info_serializes_stage() {
        let info = VersionInfo {
            pipelink: "0.1.0".to_string(),
            stage: None,
        }
        .with_stage("passthrough");
        insta::assert_json_snapshot!(info, @r#"
        {
          "pipelink": "0.1.0",
          "stage": "passthrough"
        }
        "#);
    }
}
