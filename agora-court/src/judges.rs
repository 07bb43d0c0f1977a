//! Judge panel: the polymorphic evaluators behind dispute rulings.
//!
//! A judge receives the dispute context and returns a vote: an integer
//! `worker_pct` in `[0, 100]` plus non-empty reasoning. Production panels
//! use `LlmJudge` against an OpenAI-style chat-completions endpoint; tests
//! and offline runs use `FixedJudge`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use agora_core::error::{ServiceError, ServiceResult};
use agora_core::time::now_iso;

use crate::config::JudgesSection;

/// Everything a judge sees about a dispute
#[derive(Debug, Clone)]
pub struct DisputeContext {
    pub task_title: String,
    pub reward: i64,
    pub task_spec: String,
    pub deliverables: Vec<String>,
    pub claim: String,
    pub rebuttal: Option<String>,
}

/// One judge's verdict
#[derive(Debug, Clone)]
pub struct JudgeVote {
    pub judge_id: String,
    pub worker_pct: i64,
    pub reasoning: String,
    pub voted_at: String,
}

#[async_trait]
pub trait Judge: Send + Sync {
    fn id(&self) -> &str;

    /// Evaluate the dispute. Any failure is surfaced as `JUDGE_UNAVAILABLE`
    /// by the orchestrator; the dispute stays retriable.
    async fn evaluate(&self, context: &DisputeContext) -> ServiceResult<JudgeVote>;
}

/// Deterministic judge for tests and offline panels
pub struct FixedJudge {
    id: String,
    worker_pct: i64,
    reasoning: String,
}

impl FixedJudge {
    pub fn new(id: impl Into<String>, worker_pct: i64, reasoning: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            worker_pct,
            reasoning: reasoning.into(),
        }
    }
}

#[async_trait]
impl Judge for FixedJudge {
    fn id(&self) -> &str {
        &self.id
    }

    async fn evaluate(&self, _context: &DisputeContext) -> ServiceResult<JudgeVote> {
        Ok(JudgeVote {
            judge_id: self.id.clone(),
            worker_pct: self.worker_pct,
            reasoning: self.reasoning.clone(),
            voted_at: now_iso(),
        })
    }
}

const SYSTEM_PROMPT: &str = "You are an impartial arbiter for a task marketplace. A poster \
claims a worker's deliverables do not satisfy the task specification. Decide what percentage \
of the escrowed reward the worker has earned. Respond with a JSON object: \
{\"worker_pct\": <integer 0-100>, \"reasoning\": \"<one short paragraph>\"}.";

/// Judge backed by an OpenAI-style chat-completions API
pub struct LlmJudge {
    id: String,
    model: String,
    temperature: f64,
    api_base: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl LlmJudge {
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        temperature: f64,
        api_base: impl Into<String>,
        api_key: Option<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            temperature,
            api_base: api_base.into(),
            api_key,
            http,
        }
    }

    fn unavailable(&self) -> ServiceError {
        ServiceError::unavailable(
            "JUDGE_UNAVAILABLE",
            format!("Judge {} unavailable", self.id),
        )
    }

    fn prompt(context: &DisputeContext) -> String {
        let rebuttal = context
            .rebuttal
            .as_deref()
            .unwrap_or("No rebuttal submitted");
        format!(
            "Task: {title}\nReward: {reward} credits\n\nSpecification:\n{spec}\n\n\
             Deliverables:\n{deliverables}\n\nPoster's claim:\n{claim}\n\n\
             Worker's rebuttal:\n{rebuttal}",
            title = context.task_title,
            reward = context.reward,
            spec = context.task_spec,
            deliverables = context.deliverables.join("\n"),
            claim = context.claim,
        )
    }
}

#[async_trait]
impl Judge for LlmJudge {
    fn id(&self) -> &str {
        &self.id
    }

    async fn evaluate(&self, context: &DisputeContext) -> ServiceResult<JudgeVote> {
        let url = format!("{}/chat/completions", self.api_base);
        let mut request = self.http.post(&url).json(&json!({
            "model": self.model,
            "temperature": self.temperature,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": Self::prompt(context)},
            ],
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|_| self.unavailable())?;
        if !response.status().is_success() {
            return Err(self.unavailable());
        }
        let body: Value = response.json().await.map_err(|_| self.unavailable())?;

        let content = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| self.unavailable())?;

        let parsed: Value = serde_json::from_str(content).map_err(|_| self.unavailable())?;
        let worker_pct = parsed
            .get("worker_pct")
            .and_then(Value::as_i64)
            .filter(|pct| (0..=100).contains(pct))
            .ok_or_else(|| self.unavailable())?;
        let reasoning = parsed
            .get("reasoning")
            .and_then(Value::as_str)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| self.unavailable())?
            .to_string();

        Ok(JudgeVote {
            judge_id: self.id.clone(),
            worker_pct,
            reasoning,
            voted_at: now_iso(),
        })
    }
}

/// Build the configured panel.
///
/// With `api_base` set every configured judge becomes an `LlmJudge`;
/// without it the panel is empty and rulings surface `JUDGE_UNAVAILABLE`
/// until the operator configures one.
pub fn build_panel(
    section: &JudgesSection,
    http: reqwest::Client,
) -> anyhow::Result<Vec<Arc<dyn Judge>>> {
    section.validate()?;
    let Some(api_base) = &section.api_base else {
        return Ok(Vec::new());
    };
    let api_key = section
        .api_key_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok());

    Ok(section
        .judges
        .iter()
        .map(|entry| {
            Arc::new(LlmJudge::new(
                entry.id.clone(),
                entry.model.clone(),
                entry.temperature.unwrap_or(0.2),
                api_base.clone(),
                api_key.clone(),
                http.clone(),
            )) as Arc<dyn Judge>
        })
        .collect())
}
