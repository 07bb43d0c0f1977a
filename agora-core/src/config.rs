//! Configuration loading shared by all services.
//!
//! Each service owns a YAML file deserialized into its `Settings` struct.
//! There are no defaults and unknown keys are rejected: a typo in the config
//! is a startup failure, not a silently ignored knob.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Service identity section
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSection {
    pub name: String,
    pub version: String,
}

/// HTTP server section
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

/// Logging section
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    pub level: String,
    pub directory: Option<String>,
}

/// SQLite database section
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSection {
    pub path: String,
}

/// Connection settings for a collaborator service
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    pub base_url: String,
    pub timeout_seconds: u64,
}

/// Platform agent section
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformSection {
    pub agent_id: String,
    pub private_key_path: Option<String>,
}

/// Request handling section
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestSection {
    pub max_body_size: usize,
}

/// Resolve the config path: explicit flag, then `AGORA_CONFIG`, then
/// `CONFIG_PATH`, then `./config.yaml`.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    for var in ["AGORA_CONFIG", "CONFIG_PATH"] {
        if let Ok(value) = env::var(var) {
            if !value.is_empty() {
                return PathBuf::from(value);
            }
        }
    }
    PathBuf::from("config.yaml")
}

/// Load and deserialize a YAML settings file.
///
/// `deny_unknown_fields` on every section makes unrecognized keys fail here.
pub fn load_settings<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .with_context(|| format!("reading config {}", path.display()))?;
    raw.try_deserialize::<T>()
        .with_context(|| format!("invalid config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct TestSettings {
        service: ServiceSection,
        server: ServerSection,
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_well_formed_yaml() {
        let file = write_config(
            "service:\n  name: identity\n  version: 0.1.0\nserver:\n  host: 127.0.0.1\n  port: 8001\n",
        );
        let settings: TestSettings = load_settings(file.path()).unwrap();
        assert_eq!(settings.service.name, "identity");
        assert_eq!(settings.server.port, 8001);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_config(
            "service:\n  name: identity\n  version: 0.1.0\n  flavor: vanilla\nserver:\n  host: 127.0.0.1\n  port: 8001\n",
        );
        assert!(load_settings::<TestSettings>(file.path()).is_err());
    }

    #[test]
    fn missing_sections_are_rejected() {
        let file = write_config("service:\n  name: identity\n  version: 0.1.0\n");
        assert!(load_settings::<TestSettings>(file.path()).is_err());
    }

    #[test]
    fn explicit_path_wins() {
        let path = resolve_config_path(Some(PathBuf::from("/etc/agora/bank.yaml")));
        assert_eq!(path, PathBuf::from("/etc/agora/bank.yaml"));
    }
}
