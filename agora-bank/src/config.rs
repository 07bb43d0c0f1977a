//! Central Bank service configuration.

use serde::Deserialize;

use agora_core::config::{
    ClientSection, DatabaseSection, LoggingSection, PlatformSection, RequestSection,
    ServerSection, ServiceSection,
};

/// Root configuration for the Central Bank service
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub service: ServiceSection,
    pub server: ServerSection,
    pub logging: LoggingSection,
    pub database: DatabaseSection,
    pub identity: ClientSection,
    pub platform: PlatformSection,
    pub request: RequestSection,
}
