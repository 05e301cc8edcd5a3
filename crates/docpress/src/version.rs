//! Version information for docpress.

/// docpress version from Cargo.toml
pub const DOCPRESS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub docpress: &'static str,
    /// Office backend description (if known).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            docpress: DOCPRESS_VERSION,
            backend: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: String) -> Self {
        self.backend = Some(backend);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.docpress, DOCPRESS_VERSION);
        assert!(info.backend.is_none());
    }

    #[test]
    fn version_info_serializes() {
        let info = VersionInfo {
            docpress: "0.1.0",
            backend: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "docpress": "0.1.0"
        }
        "#);

        let info = info.with_backend("soffice (soffice)".to_string());
        insta::assert_json_snapshot!(info, @r#"
        {
          "docpress": "0.1.0",
          "backend": "soffice (soffice)"
        }
        "#);
    }
}
