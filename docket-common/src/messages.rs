//! Queue message schemas
//!
//! These structs are the wire contract between pipeline stages. Field names
//! are stable; every message is JSON and decoding validates the message
//! after parsing, so a consumer either gets a well-formed value or an
//! [`Error::InvalidInput`] it can drop.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Queue consumed by the extraction stage
pub const INTAKE_QUEUE: &str = "job_intake_queue";
/// Queue consumed by the scoring stage
pub const ANALYSIS_QUEUE: &str = "analysis_queue";
/// Queue consumed by the fan-in (store) stage
pub const RESULTS_QUEUE: &str = "results_queue";

/// A JSON message bound to a single queue
pub trait WireMessage: Serialize + DeserializeOwned + Sized {
    /// Queue this message type travels on
    const QUEUE: &'static str;

    /// Structural checks beyond what serde enforces
    fn validate(&self) -> Result<()>;

    /// Parse and validate a message body
    fn decode(body: &str) -> Result<Self> {
        let message: Self = serde_json::from_str(body)
            .map_err(|e| Error::InvalidInput(format!("malformed {} message: {}", Self::QUEUE, e)))?;
        message.validate()?;
        Ok(message)
    }

    fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// One staged file in an intake message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeItem {
    pub item_id: String,
    /// Location of the staged payload
    pub path: String,
    pub display_name: String,
}

/// Submission → extraction. Incremental additions carry only the new items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeMessage {
    pub job_id: String,
    pub correlation_id: String,
    pub target_text: String,
    #[serde(default)]
    pub use_rate_limit: bool,
    pub items: Vec<IntakeItem>,
}

impl WireMessage for IntakeMessage {
    const QUEUE: &'static str = INTAKE_QUEUE;

    fn validate(&self) -> Result<()> {
        require_non_empty("job_id", &self.job_id)?;
        if self.items.is_empty() {
            return Err(Error::InvalidInput("intake message has no items".into()));
        }
        for item in &self.items {
            require_non_empty("item_id", &item.item_id)?;
            require_non_empty("path", &item.path)?;
        }
        Ok(())
    }
}

/// One extracted document in an analysis message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisItem {
    pub item_id: String,
    pub display_name: String,
    pub extracted_text: String,
}

/// Extraction → scoring. Only items that extracted successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisMessage {
    pub job_id: String,
    pub correlation_id: String,
    pub target_text: String,
    #[serde(default)]
    pub use_rate_limit: bool,
    pub items: Vec<AnalysisItem>,
}

impl WireMessage for AnalysisMessage {
    const QUEUE: &'static str = ANALYSIS_QUEUE;

    fn validate(&self) -> Result<()> {
        require_non_empty("job_id", &self.job_id)?;
        require_non_empty("target_text", &self.target_text)?;
        if self.items.is_empty() {
            return Err(Error::InvalidInput("analysis message has no items".into()));
        }
        for item in &self.items {
            require_non_empty("item_id", &item.item_id)?;
        }
        Ok(())
    }
}

/// Terminal outcome of one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
        }
    }
}

/// Any stage → fan-in. Exactly one per item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub job_id: String,
    pub correlation_id: String,
    pub item_id: String,
    pub display_name: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ScoreCard>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultMessage {
    pub fn success(
        job_id: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: ScoreCard,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            correlation_id: correlation_id.into(),
            item_id: payload.item_id.clone(),
            display_name: payload.display_name.clone(),
            outcome: Outcome::Success,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(
        job_id: impl Into<String>,
        correlation_id: impl Into<String>,
        item_id: impl Into<String>,
        display_name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            correlation_id: correlation_id.into(),
            item_id: item_id.into(),
            display_name: display_name.into(),
            outcome: Outcome::Error,
            payload: None,
            error: Some(error.into()),
        }
    }
}

impl WireMessage for ResultMessage {
    const QUEUE: &'static str = RESULTS_QUEUE;

    fn validate(&self) -> Result<()> {
        require_non_empty("job_id", &self.job_id)?;
        require_non_empty("item_id", &self.item_id)?;
        match (self.outcome, &self.payload, &self.error) {
            (Outcome::Success, Some(card), None) => {
                if card.item_id != self.item_id {
                    return Err(Error::InvalidInput(format!(
                        "payload item_id {} does not match {}",
                        card.item_id, self.item_id
                    )));
                }
                card.validate()
            }
            (Outcome::Error, None, Some(_)) => Ok(()),
            (outcome, _, _) => Err(Error::InvalidInput(format!(
                "{} result must carry exactly {}",
                outcome.as_str(),
                if outcome == Outcome::Success { "a payload" } else { "an error" }
            ))),
        }
    }
}

/// Learning curve / risk grade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation {
    #[serde(rename = "Strong Hire")]
    StrongHire,
    #[serde(rename = "Interview for Potential")]
    InterviewForPotential,
    #[serde(rename = "Backup")]
    Backup,
    #[serde(rename = "Review Needed")]
    ReviewNeeded,
    #[serde(rename = "No Fit")]
    NoFit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConceptualMatch {
    pub requested_skill: String,
    pub found_skill: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkillGap {
    pub missing_skill: String,
    pub learning_curve: Level,
}

fn default_subject_name() -> String {
    "Unknown Candidate".to_string()
}

/// Structured scoring result for one document. Unknown fields are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoreCard {
    pub item_id: String,
    pub display_name: String,
    #[serde(default = "default_subject_name")]
    pub subject_name: String,
    /// 0..=100
    pub match_score: u8,
    pub summary_headline: String,
    #[serde(default)]
    pub conceptual_matches: Vec<ConceptualMatch>,
    #[serde(default)]
    pub skill_gaps: Vec<SkillGap>,
    pub experience_analysis: String,
    pub recommendation: Recommendation,
    pub risk_assessment: Level,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linkedin_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portfolio_url: Option<String>,
}

impl ScoreCard {
    pub fn validate(&self) -> Result<()> {
        if self.match_score > 100 {
            return Err(Error::InvalidInput(format!(
                "match_score {} outside 0..=100",
                self.match_score
            )));
        }
        Ok(())
    }
}
