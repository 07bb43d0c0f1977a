//! Identity service configuration.

use serde::Deserialize;

use agora_core::config::{
    DatabaseSection, LoggingSection, RequestSection, ServerSection, ServiceSection,
};

/// Root configuration for the Identity service
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub service: ServiceSection,
    pub server: ServerSection,
    pub logging: LoggingSection,
    pub database: DatabaseSection,
    pub request: RequestSection,
}
