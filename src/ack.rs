//! Acknowledgment composition and dispatch.
//!
//! On the NEW path the customer gets a personalized acknowledgment carrying
//! the ticket identifier so later replies can be correlated. Sending is
//! best-effort: the ticket record exists whether or not the provider
//! accepts the message, and the orchestrator only flips `ack_sent` after a
//! 2xx.

use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::ticket::TicketId;

/// Short delay before the first attempt, avoiding connection races with the
/// webhook response.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Greeting uses the first name only at or above this extraction confidence.
const GREETING_CONFIDENCE_THRESHOLD: f32 = 0.5;

const DEFAULT_TEXT_TEMPLATE: &str = "{greeting},

Thank you for contacting {short_name}. We have received your enquiry and assigned it ticket number {ticket_id}.

Original Subject: {original_subject}
Priority: {priority}
Ticket Number: {ticket_id}

We will review your request and respond within our standard timeframe:

- Urgent matters: within 4 hours
- High priority: within 24 hours
- Normal requests: within 2-3 business days

If you need to follow up on this matter, please reference ticket number {ticket_id} in your subject line.

Original enquiry (for reference):

{original_body}

Best regards,
{short_name} Team

---
This is an automated response.
";

const DEFAULT_HTML_TEMPLATE: &str = "<div style=\"font-family: sans-serif; max-width: 600px;\">
<p>{greeting},</p>
<p>Thank you for contacting {short_name}. We have received your enquiry and assigned it ticket number <strong>{ticket_id}</strong>.</p>
<p><strong>Original Subject:</strong> {original_subject}<br>
<strong>Priority:</strong> {priority}<br>
<strong>Ticket Number:</strong> {ticket_id}</p>
<p>We will review your request and respond within our standard timeframe:</p>
<ul>
<li>Urgent matters: within 4 hours</li>
<li>High priority: within 24 hours</li>
<li>Normal requests: within 2-3 business days</li>
</ul>
<p>If you need to follow up on this matter, please reference ticket number {ticket_id} in your subject line.</p>
<blockquote>{original_body}</blockquote>
<p>Best regards,<br><strong>{short_name} Team</strong></p>
<p><em>This is an automated response.</em></p>
</div>
";

#[derive(Debug, thiserror::Error)]
pub enum AckError {
    #[error("mail request failed: {0}")]
    Http(String),
    #[error("mail provider returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// Priority tier quoted in the acknowledgment. Supplied by the caller;
/// the pipeline passes the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    High,
    Urgent,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Normal => write!(f, "Normal"),
            Priority::High => write!(f, "High"),
            Priority::Urgent => write!(f, "Urgent"),
        }
    }
}

/// Template pair with `{greeting}`, `{first_name}`, `{ticket_id}`,
/// `{original_subject}`, `{original_body}`, `{priority}` and `{short_name}`
/// substitutions.
#[derive(Debug, Clone)]
pub struct AckTemplates {
    pub text: String,
    pub html: String,
}

impl Default for AckTemplates {
    fn default() -> Self {
        Self {
            text: DEFAULT_TEXT_TEMPLATE.to_string(),
            html: DEFAULT_HTML_TEMPLATE.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AckConfig {
    pub api_url: String,
    pub api_key: String,
    pub from_addr: String,
    pub cc_addr: Option<String>,
    pub short_name: String,
    pub retries: u32,
    pub base_delay: Duration,
    pub deadline: Duration,
}

/// Everything the sender needs from one NEW-path message.
#[derive(Debug, Clone)]
pub struct AckRequest {
    pub ticket_id: TicketId,
    pub to_addr: String,
    pub first_name: String,
    pub name_confidence: f32,
    pub original_subject: String,
    pub original_body: String,
    pub priority: Priority,
}

pub struct AckSender {
    config: AckConfig,
    templates: AckTemplates,
    client: Client,
}

impl AckSender {
    pub fn new(config: AckConfig, templates: AckTemplates) -> Self {
        let client = Client::builder()
            .timeout(config.deadline)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            config,
            templates,
            client,
        }
    }

    /// Render subject and both bodies for one request.
    pub fn render(&self, request: &AckRequest) -> (String, String, String) {
        let subject = format!(
            "[{}] {} - Call Logged",
            request.ticket_id, self.config.short_name
        );
        let greeting = if request.name_confidence >= GREETING_CONFIDENCE_THRESHOLD
            && !request.first_name.trim().is_empty()
        {
            format!("Hi {}", request.first_name.trim())
        } else {
            "Hello".to_string()
        };
        let substitute = |template: &str| {
            template
                .replace("{greeting}", &greeting)
                .replace("{first_name}", request.first_name.trim())
                .replace("{ticket_id}", request.ticket_id.as_str())
                .replace("{original_subject}", &request.original_subject)
                .replace("{original_body}", &request.original_body)
                .replace("{priority}", &request.priority.to_string())
                .replace("{short_name}", &self.config.short_name)
        };
        (
            subject,
            substitute(&self.templates.text),
            substitute(&self.templates.html),
        )
    }

    /// Compose and dispatch. Success means the provider accepted with a 2xx;
    /// after the initial attempt, up to `retries` further attempts are made,
    /// spaced at base-delay multiples (2 s, 4 s, 6 s at defaults).
    pub async fn send(&self, request: &AckRequest) -> Result<(), AckError> {
        let (subject, text, html) = self.render(request);

        let mut personalization = json!({"to": [{"email": request.to_addr}]});
        if let Some(cc_addr) = self
            .config
            .cc_addr
            .as_deref()
            .filter(|addr| !addr.trim().is_empty())
        {
            personalization["cc"] = json!([{"email": cc_addr}]);
        }
        let payload = json!({
            "personalizations": [personalization],
            "from": {"email": self.config.from_addr},
            "reply_to": {"email": request.to_addr},
            "subject": subject,
            "content": [
                {"type": "text/plain", "value": text},
                {"type": "text/html", "value": html},
            ],
        });

        sleep(SETTLE_DELAY).await;
        let url = format!(
            "{}/v3/mail/send",
            self.config.api_url.trim_end_matches('/')
        );
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.dispatch(&url, &payload).await {
                Ok(()) => {
                    info!(
                        "acknowledgment for {} accepted by mail provider",
                        request.ticket_id
                    );
                    return Ok(());
                }
                Err(err) if attempt <= self.config.retries => {
                    let delay = self.config.base_delay * attempt;
                    warn!(
                        "acknowledgment send failed ({}), retry {}/{} in {:?}",
                        err, attempt, self.config.retries, delay
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn dispatch(&self, url: &str, payload: &serde_json::Value) -> Result<(), AckError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|err| AckError::Http(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(AckError::Api {
                status: status.as_u16(),
                body,
            })
        }
    }
}
