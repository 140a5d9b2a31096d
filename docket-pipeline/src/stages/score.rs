//! Scoring via an external model endpoint

use async_trait::async_trait;
use docket_common::messages::{AnalysisItem, ScoreCard};
use serde::Serialize;
use tracing::{debug, warn};

use super::ItemOutcome;

#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, target_text: &str, item: &AnalysisItem) -> ItemOutcome<ScoreCard>;
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    item_id: &'a str,
    display_name: &'a str,
    target_text: &'a str,
    document_text: &'a str,
}

/// POSTs `{item_id, display_name, target_text, document_text}` and expects a
/// score card body. `item_id` and `display_name` are filled in if the
/// endpoint omits them.
#[derive(Debug, Clone)]
pub struct HttpScorer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpScorer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Scorer for HttpScorer {
    async fn score(&self, target_text: &str, item: &AnalysisItem) -> ItemOutcome<ScoreCard> {
        let request = ScoreRequest {
            item_id: &item.item_id,
            display_name: &item.display_name,
            target_text,
            document_text: &item.extracted_text,
        };

        let response = match self.client.post(&self.endpoint).json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Scoring endpoint unreachable");
                return ItemOutcome::Fatal(format!("scoring endpoint unreachable: {}", e));
            }
        };

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return ItemOutcome::Fatal(format!("scoring endpoint returned {}", status));
        }
        if !status.is_success() {
            return ItemOutcome::item_error(&item.item_id, format!("scoring rejected item: {}", status));
        }

        let body: serde_json::Value = match response.json().await {
            Ok(body) => body,
            Err(e) => return ItemOutcome::item_error(&item.item_id, format!("invalid scoring response: {}", e)),
        };

        match into_score_card(body, item) {
            Ok(card) => {
                debug!(item_id = %item.item_id, match_score = card.match_score, "Item scored");
                ItemOutcome::Ok(card)
            }
            Err(reason) => ItemOutcome::item_error(&item.item_id, reason),
        }
    }
}

/// Attach item identity to a raw response and parse it strictly
fn into_score_card(mut body: serde_json::Value, item: &AnalysisItem) -> Result<ScoreCard, String> {
    let object = body
        .as_object_mut()
        .ok_or_else(|| "scoring response is not a JSON object".to_string())?;
    object.insert("item_id".into(), item.item_id.clone().into());
    object.insert("display_name".into(), item.display_name.clone().into());

    let card: ScoreCard =
        serde_json::from_value(body).map_err(|e| format!("scoring response failed validation: {}", e))?;
    card.validate().map_err(|e| e.to_string())?;
    Ok(card)
}
