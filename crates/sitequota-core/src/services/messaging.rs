//! Cross-context messaging
//!
//! Request/response channel between hosting contexts (popup, page, CLI) and
//! the owner of the quota state. Every response has the shape
//! `{success, data?, error?}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::services::quota::{QuotaEngine, QuotaPolicy};

// ============================================================================
// Wire Types
// ============================================================================

/// Incoming request, tagged by `action`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "camelCase")]
pub enum Request {
    /// Aggregated quota figures for display
    #[serde(alias = "getTwitterStats")]
    GetQuotaStats,
    /// Free text typed into the assistant panel
    ProcessUserInput { text: String },
}

/// Outgoing response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                error: None,
            },
            Err(e) => Self::failure(format!("Failed to encode response: {}", e)),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Page action suggested by the assistant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantAction {
    Highlight { text: String },
}

/// Assistant answer to user input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantReply {
    pub reply: String,
    pub actions: Vec<AssistantAction>,
}

/// Placeholder responder: echoes the input and extracts a `highlight` action.
pub fn assistant_reply(text: &str) -> AssistantReply {
    let lowered = text.to_ascii_lowercase();
    if let Some(pos) = lowered.find("highlight") {
        let target = format!("{}{}", &text[..pos], &text[pos + "highlight".len()..]);
        let target = target.trim();
        if !target.is_empty() {
            return AssistantReply {
                reply: format!("I've highlighted \"{}\" on the page for you.", target),
                actions: vec![AssistantAction::Highlight {
                    text: target.to_string(),
                }],
            };
        }
    }

    AssistantReply {
        reply: format!(
            "I received your message: \"{}\". This is a placeholder response.",
            text
        ),
        actions: Vec::new(),
    }
}

// ============================================================================
// Router
// ============================================================================

/// Dispatches requests against one quota engine
#[derive(Clone)]
pub struct MessageRouter {
    engine: QuotaEngine,
}

impl MessageRouter {
    pub fn new(engine: QuotaEngine) -> Self {
        Self { engine }
    }

    pub async fn handle(&self, request: Request) -> Response {
        log::debug!("[messaging] Handling {:?}", request);
        match request {
            Request::GetQuotaStats => Response::ok(self.engine.stats().await),
            Request::ProcessUserInput { text } => {
                if text.trim().is_empty() {
                    return Response::failure("No input provided");
                }
                Response::ok(assistant_reply(&text))
            }
        }
    }

    /// Decode a raw JSON request and handle it
    pub async fn handle_json(&self, raw: &str) -> Response {
        match serde_json::from_str::<Request>(raw) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                log::warn!("[messaging] Rejected malformed request: {}", e);
                Response::failure(format!("Invalid request: {}", e))
            }
        }
    }
}

// ============================================================================
// Site Matching
// ============================================================================

/// Whether a host name or URL belongs to the tracked site
pub fn is_tracked_site(url_or_host: &str, policy: &QuotaPolicy) -> bool {
    let rest = url_or_host
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url_or_host);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = authority.rsplit('@').next().unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    !host.is_empty() && policy.is_tracked_host(host)
}
