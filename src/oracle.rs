//! Remote signal oracle client
//!
//! The oracle is an LLM-backed chat service: create a session, post a prompt,
//! poll until the assistant responds with a result id, fetch the result text,
//! and parse it into a buy/sell/hold decision. Latency runs from seconds to
//! minutes, so polling is bounded and a blown budget surfaces as an error the
//! engine downgrades to "hold".

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const POLL_ATTEMPTS: u32 = 60;
const POLL_DELAY: Duration = Duration::from_secs(5);

/// Oracle verdict for one ticker/date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleAction {
    Buy,
    Sell,
    Hold,
}

impl OracleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OracleAction::Buy => "buy",
            OracleAction::Sell => "sell",
            OracleAction::Hold => "hold",
        }
    }
}

impl std::fmt::Display for OracleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed oracle response; confidence and raw text are diagnostic only
#[derive(Debug, Clone)]
pub struct OracleDecision {
    pub signal: OracleAction,
    pub confidence: f64,
    pub raw_text: String,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ChatListEntry {
    #[serde(default)]
    respond_to: Option<String>,
    #[serde(default)]
    result_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResultResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

/// HTTP client for the chat-style oracle API
pub struct OracleClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    poll_attempts: u32,
    poll_delay: Duration,
}

impl OracleClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            poll_attempts: POLL_ATTEMPTS,
            poll_delay: POLL_DELAY,
        }
    }

    /// Shorten the poll budget, mainly for tests
    pub fn with_poll_budget(mut self, attempts: u32, delay: Duration) -> Self {
        self.poll_attempts = attempts;
        self.poll_delay = delay;
        self
    }

    /// Run one prompt through the oracle and parse the decision
    pub async fn evaluate(
        &self,
        slug: &str,
        ticker: &str,
        params: &[(String, String)],
    ) -> Result<OracleDecision> {
        let session_id = self.create_session().await?;
        let prompt = build_prompt(slug, ticker, params);
        debug!(%ticker, slug, "sending oracle prompt");
        let chat_id = self.send_message(&session_id, &prompt).await?;
        let result_id = self.poll_for_result(&session_id, &chat_id).await?;
        let text = self.fetch_result(&result_id).await?;
        Ok(parse_decision(&text))
    }

    async fn create_session(&self) -> Result<String> {
        let response: SessionResponse = self
            .client
            .post(format!("{}/api/sessions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({}))
            .send()
            .await
            .context("oracle session request failed")?
            .error_for_status()
            .context("oracle session request rejected")?
            .json()
            .await
            .context("invalid oracle session response")?;
        Ok(response.id)
    }

    async fn send_message(&self, session_id: &str, message: &str) -> Result<String> {
        let response: ChatResponse = self
            .client
            .post(format!("{}/api/sessions/{}/chats", self.base_url, session_id))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "message": message }))
            .send()
            .await
            .context("oracle chat request failed")?
            .error_for_status()
            .context("oracle chat request rejected")?
            .json()
            .await
            .context("invalid oracle chat response")?;
        Ok(response.id)
    }

    /// Poll the session until a response to `chat_id` carries a result id
    async fn poll_for_result(&self, session_id: &str, chat_id: &str) -> Result<String> {
        for attempt in 0..self.poll_attempts {
            tokio::time::sleep(self.poll_delay).await;
            let chats: Vec<ChatListEntry> = self
                .client
                .get(format!("{}/api/sessions/{}/chats", self.base_url, session_id))
                .bearer_auth(&self.api_key)
                .send()
                .await
                .context("oracle poll request failed")?
                .error_for_status()
                .context("oracle poll request rejected")?
                .json()
                .await
                .context("invalid oracle poll response")?;

            for chat in chats {
                if chat.respond_to.as_deref() == Some(chat_id) {
                    if let Some(result_id) = chat.result_id {
                        debug!(attempt, "oracle result ready");
                        return Ok(result_id);
                    }
                }
            }
        }
        bail!(
            "oracle poll budget exhausted after {} attempts",
            self.poll_attempts
        )
    }

    async fn fetch_result(&self, result_id: &str) -> Result<String> {
        let response: ResultResponse = self
            .client
            .get(format!("{}/api/results/{}", self.base_url, result_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("oracle result request failed")?
            .error_for_status()
            .context("oracle result request rejected")?
            .json()
            .await
            .context("invalid oracle result response")?;
        match response.text.or(response.content) {
            Some(text) => Ok(text),
            None => {
                warn!(result_id, "oracle result had no text field");
                Ok(String::new())
            }
        }
    }
}

/// Build the chat prompt: `cot {slug} $stock_symbol:X $key:value ...`
pub fn build_prompt(slug: &str, ticker: &str, params: &[(String, String)]) -> String {
    let mut prompt = format!("cot {slug} $stock_symbol:{ticker}");
    for (key, value) in params {
        prompt.push_str(&format!(" ${key}:{value}"));
    }
    prompt
}

const POSITIVE_WORDS: &[&str] = &["bullish", "growth", "upside", "positive", "strong", "outperform"];
const NEGATIVE_WORDS: &[&str] = &["bearish", "decline", "downside", "negative", "weak", "underperform"];

/// Keyword scan with a sentiment fallback
///
/// Explicit buy/sell/hold keywords win; otherwise positive vs negative word
/// counts break the tie at low confidence.
pub fn parse_decision(text: &str) -> OracleDecision {
    let lower = text.to_lowercase();

    let (signal, confidence) = if lower.contains("strong buy") {
        (OracleAction::Buy, 0.9)
    } else if lower.contains("strong sell") {
        (OracleAction::Sell, 0.9)
    } else if lower.contains("buy") {
        (OracleAction::Buy, 0.7)
    } else if lower.contains("sell") || lower.contains("exit") {
        (OracleAction::Sell, 0.7)
    } else if lower.contains("hold") {
        (OracleAction::Hold, 0.6)
    } else {
        let positive = POSITIVE_WORDS.iter().filter(|w| lower.contains(**w)).count();
        let negative = NEGATIVE_WORDS.iter().filter(|w| lower.contains(**w)).count();
        if positive > negative {
            (OracleAction::Buy, 0.5)
        } else if negative > positive {
            (OracleAction::Sell, 0.5)
        } else {
            (OracleAction::Hold, 0.5)
        }
    };

    OracleDecision {
        signal,
        confidence,
        raw_text: text.to_string(),
    }
}
