//! Task Board service configuration.

use serde::Deserialize;

use agora_core::config::{
    ClientSection, DatabaseSection, LoggingSection, PlatformSection, RequestSection,
    ServerSection, ServiceSection,
};

/// Asset custody settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetsSection {
    pub storage_path: String,
    pub max_file_size: usize,
    pub max_files_per_task: usize,
}

/// Field length caps
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsSection {
    pub max_title_length: usize,
    pub max_spec_length: usize,
    pub max_reason_length: usize,
}

/// Root configuration for the Task Board service
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub service: ServiceSection,
    pub server: ServerSection,
    pub logging: LoggingSection,
    pub database: DatabaseSection,
    pub identity: ClientSection,
    pub central_bank: ClientSection,
    pub platform: PlatformSection,
    pub request: RequestSection,
    pub assets: AssetsSection,
    pub limits: LimitsSection,
}
