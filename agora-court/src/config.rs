//! Court service configuration.

use serde::Deserialize;

use agora_core::config::{
    ClientSection, DatabaseSection, LoggingSection, PlatformSection, RequestSection,
    ServerSection, ServiceSection,
};

/// Dispute filing limits and the rebuttal window
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DisputesSection {
    pub rebuttal_deadline_seconds: i64,
    pub max_claim_length: usize,
    pub max_rebuttal_length: usize,
}

/// One judge on the panel
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JudgeEntry {
    pub id: String,
    pub model: String,
    pub temperature: Option<f64>,
}

/// Judge panel configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JudgesSection {
    pub panel_size: usize,
    /// OpenAI-style chat-completions endpoint; without it the panel is
    /// empty and rulings surface `JUDGE_UNAVAILABLE` until configured.
    pub api_base: Option<String>,
    /// Environment variable holding the judge API key
    pub api_key_env: Option<String>,
    pub judges: Vec<JudgeEntry>,
}

impl JudgesSection {
    /// Panel must be odd-sized (unique median), sized like its judge list,
    /// and free of duplicate ids. Checked at startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.panel_size < 1 || self.panel_size % 2 == 0 {
            anyhow::bail!("judges.panel_size must be odd and >= 1");
        }
        if self.panel_size != self.judges.len() {
            anyhow::bail!("judges.panel_size must equal the number of judges");
        }
        let mut seen = std::collections::HashSet::new();
        for judge in &self.judges {
            if !seen.insert(judge.id.as_str()) {
                anyhow::bail!("duplicate judge id: {}", judge.id);
            }
        }
        Ok(())
    }
}

/// Root configuration for the Court service
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub service: ServiceSection,
    pub server: ServerSection,
    pub logging: LoggingSection,
    pub database: DatabaseSection,
    pub identity: ClientSection,
    pub central_bank: ClientSection,
    pub task_board: ClientSection,
    pub reputation: ClientSection,
    pub platform: PlatformSection,
    pub disputes: DisputesSection,
    pub judges: JudgesSection,
    pub request: RequestSection,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(panel_size: usize, ids: &[&str]) -> JudgesSection {
        JudgesSection {
            panel_size,
            api_base: None,
            api_key_env: None,
            judges: ids
                .iter()
                .map(|id| JudgeEntry {
                    id: id.to_string(),
                    model: "gpt-test".to_string(),
                    temperature: Some(0.2),
                })
                .collect(),
        }
    }

    #[test]
    fn odd_panels_validate() {
        assert!(section(1, &["j1"]).validate().is_ok());
        assert!(section(3, &["j1", "j2", "j3"]).validate().is_ok());
    }

    #[test]
    fn even_or_empty_panels_are_rejected() {
        assert!(section(0, &[]).validate().is_err());
        assert!(section(2, &["j1", "j2"]).validate().is_err());
    }

    #[test]
    fn size_mismatch_and_duplicates_are_rejected() {
        assert!(section(3, &["j1", "j2"]).validate().is_err());
        assert!(section(3, &["j1", "j1", "j2"]).validate().is_err());
    }
}
