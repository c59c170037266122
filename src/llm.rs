//! LLM risk-assessment transport.
//!
//! Chat-completion client with a strict JSON contract: the model must return
//! exactly the assessment schema. Anything else — transport error, timeout,
//! schema drift, out-of-range confidence — surfaces as an error and the
//! caller falls back to the rule verdict. The pipeline never blocks on this.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::Config;
use crate::models::RiskLevel;

#[derive(Debug, Clone, Serialize)]
pub struct AssessmentRequest {
    pub prompt_version: String,
    pub title: String,
    pub description: String,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskAssessment {
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub summary: String,
    pub buyer_notes: String,
}

impl RiskAssessment {
    /// Enforce the schema contract beyond what serde checks.
    pub fn validate(self) -> Result<Self> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(anyhow!("confidence {} out of range", self.confidence));
        }
        Ok(self)
    }
}

#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn assess(&self, req: &AssessmentRequest) -> Result<RiskAssessment>;
}

const SYSTEM_PROMPT: &str = "\
You review Bulgarian used-car classified ads for buyer risk. Respond with \
ONLY a JSON object: {\"risk_level\": \"green\"|\"yellow\"|\"red\", \
\"confidence\": 0.0-1.0, \"reasons\": [string], \"summary\": string, \
\"buyer_notes\": string}. Consider undisclosed accident damage, salvage \
history, odometer tampering, gray imports, and pressure-sale language.";

#[derive(Clone)]
pub struct HttpLlmClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl HttpLlmClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.llm_timeout_ms))
            .user_agent("CarScout/1.0 (risk assessment)")
            .build()
            .context("build LLM HTTP client")?;
        Ok(Self {
            http,
            endpoint: config.llm_endpoint.clone(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Models occasionally wrap JSON in a markdown fence; tolerate that one
/// deviation, nothing else.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[async_trait]
impl LlmTransport for HttpLlmClient {
    async fn assess(&self, req: &AssessmentRequest) -> Result<RiskAssessment> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow!("LLM_API_KEY not configured"))?;

        let user_payload = serde_json::json!({
            "prompt_version": req.prompt_version,
            "title": req.title,
            "description": req.description,
            "features": req.features,
        });
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_payload.to_string()},
            ],
            "temperature": 0.0,
        });

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .context("LLM request failed")?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("LLM endpoint returned {status}"));
        }

        let chat: ChatResponse = resp.json().await.context("parse LLM envelope")?;
        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| anyhow!("LLM returned no choices"))?;

        let assessment: RiskAssessment = serde_json::from_str(strip_code_fence(content))
            .context("LLM response violated schema")?;
        assessment.validate()
    }
}

/// Canned transport for tests: returns a fixed assessment or a fixed error.
pub struct StaticLlm {
    pub result: parking_lot::Mutex<Option<RiskAssessment>>,
}

impl StaticLlm {
    pub fn returning(assessment: RiskAssessment) -> Self {
        Self {
            result: parking_lot::Mutex::new(Some(assessment)),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            result: parking_lot::Mutex::new(None),
        }
    }
}

#[async_trait]
impl LlmTransport for StaticLlm {
    async fn assess(&self, _req: &AssessmentRequest) -> Result<RiskAssessment> {
        match self.result.lock().clone() {
            Some(a) => Ok(a),
            None => Err(anyhow!("llm unavailable")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_strict() {
        let good = r#"{"risk_level":"yellow","confidence":0.8,"reasons":["import"],
                       "summary":"s","buyer_notes":"n"}"#;
        assert!(serde_json::from_str::<RiskAssessment>(good).is_ok());

        let extra_field = r#"{"risk_level":"green","confidence":0.5,"reasons":[],
                              "summary":"s","buyer_notes":"n","mood":"great"}"#;
        assert!(serde_json::from_str::<RiskAssessment>(extra_field).is_err());

        let missing = r#"{"risk_level":"green","confidence":0.5}"#;
        assert!(serde_json::from_str::<RiskAssessment>(missing).is_err());
    }

    #[test]
    fn confidence_bounds_are_enforced() {
        let out_of_range = RiskAssessment {
            risk_level: RiskLevel::Green,
            confidence: 1.2,
            reasons: vec![],
            summary: String::new(),
            buyer_notes: String::new(),
        };
        assert!(out_of_range.validate().is_err());
    }

    #[test]
    fn code_fences_are_tolerated() {
        let fenced = "```json\n{\"risk_level\":\"red\",\"confidence\":0.9,\"reasons\":[],\
                      \"summary\":\"s\",\"buyer_notes\":\"n\"}\n```";
        let parsed: RiskAssessment = serde_json::from_str(strip_code_fence(fenced)).unwrap();
        assert_eq!(parsed.risk_level, RiskLevel::Red);
    }
}
