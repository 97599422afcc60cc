//! Configuration record for the fingerprinting service.
//!
//! The script reads this from the `_smConf` global before it contacts its
//! backend. Field names follow the script's expectations.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Service parameters exposed to the script as `_smConf`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    /// Organization identifier issued by the service.
    pub organization: String,
    /// Application identifier within the organization.
    pub app_id: String,
    /// Base64 DER public key used to seal the collected profile.
    pub public_key: String,
    /// `http` or `https`.
    pub protocol: String,
    /// Backend host.
    pub api_host: String,
    /// Backend path.
    pub api_path: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            organization: "UWXspnCCJN4sfYlNfqps".to_string(),
            app_id: "default".to_string(),
            public_key: "MIGfMA0GCSqGSIb3DQEBAQUAA4GNADCBiQKBgQCmxMNr7n8ZeT0tE1R9j/mPixoinPkeM+k4VGIn/s0k7N5rJAfnZ0eMER+QhwFvshzo0LNmeUUpR8uAcxHkHD6ydDUzQPhEMjmyq6fQMu4R1bGM6FBPiWxZ9ZUQ8AWn46fKOmtVuyU1hOBx3qDgMv/i3t6fFaN4F7fF/n7yKHfjU3hQIDAQAB".to_string(),
            protocol: "https".to_string(),
            api_host: "fp-it.portal101.cn".to_string(),
            api_path: "/deviceprofile/v4".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load a JSON override file. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_json_file(path: &Path) -> Result<Self, std::io::Error> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(std::io::Error::other)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_override_keeps_defaults() {
        let config: ServiceConfig =
            serde_json::from_str(r#"{"organization":"acme","apiHost":"fp.example.com"}"#)
                .unwrap();
        assert_eq!(config.organization, "acme");
        assert_eq!(config.api_host, "fp.example.com");
        assert_eq!(config.app_id, "default");
        assert_eq!(config.api_path, "/deviceprofile/v4");
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.json");
        std::fs::write(&path, r#"{"protocol":"http"}"#).unwrap();
        let config = ServiceConfig::from_json_file(&path).unwrap();
        assert_eq!(config.protocol, "http");

        std::fs::write(&path, "not json").unwrap();
        assert!(ServiceConfig::from_json_file(&path).is_err());
    }
}
