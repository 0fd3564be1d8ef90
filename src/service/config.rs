use std::env;
use std::time::Duration;

use chrono_tz::Tz;

use crate::ack::AckTemplates;
use crate::llm::LlmConfig;
use crate::store::StoreConfig;

use super::BoxError;

pub const DEFAULT_INBOUND_BODY_MAX_BYTES: usize = 25 * 1024 * 1024;

/// Sentence the default acknowledgment templates always emit; the loop
/// guard looks for it in bodies that carry our ack subject.
pub const DEFAULT_MARKER_PHRASE: &str =
    "We have received your enquiry and assigned it ticket number";

/// Every key the service reads. Any other variable under one of the
/// [`RECOGNIZED_PREFIXES`] is a configuration error.
const RECOGNIZED_KEYS: &[&str] = &[
    "SERVICE_HOST",
    "SERVICE_PORT",
    "SERVICE_MAX_BODY_BYTES",
    "SERVICE_STARTUP_HEALTHCHECK",
    "INSTALL_PREFIX",
    "INSTALL_SHORT_NAME",
    "INSTALL_TIMEZONE",
    "OUTBOUND_FROM_ADDR",
    "OUTBOUND_CC_ADDR",
    "LLM_ENABLED",
    "LLM_API_URL",
    "LLM_API_KEY",
    "LLM_MODEL",
    "LLM_DEADLINE_MS",
    "STORE_API_URL",
    "STORE_API_KEY",
    "STORE_BASE_ID",
    "STORE_TABLE",
    "STORE_DEADLINE_MS",
    "STORE_WRITE_QPS",
    "MAIL_API_URL",
    "MAIL_API_KEY",
    "MAIL_DEADLINE_MS",
    "MAIL_RETRIES",
    "MAIL_BASE_DELAY_MS",
    "DEDUP_TTL_HOURS",
    "REQUEST_DEADLINE_MS",
    "ACK_TEMPLATE_TEXT",
    "ACK_TEMPLATE_HTML",
    "ACK_MARKER_PHRASE",
];

const RECOGNIZED_PREFIXES: &[&str] = &[
    "SERVICE_", "INSTALL_", "OUTBOUND_", "LLM_", "STORE_", "MAIL_", "DEDUP_", "REQUEST_", "ACK_",
];

/// Immutable service configuration, populated once at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub install_prefix: String,
    pub install_short_name: String,
    pub timezone: Tz,
    pub outbound_from_addr: String,
    pub outbound_cc_addr: Option<String>,
    pub marker_phrase: String,
    pub llm: LlmConfig,
    pub store: StoreConfig,
    pub mail_api_url: String,
    pub mail_api_key: String,
    pub mail_deadline: Duration,
    pub mail_retries: u32,
    pub mail_base_delay: Duration,
    pub dedup_ttl: Duration,
    pub request_deadline: Duration,
    pub ack_templates: AckTemplates,
    pub inbound_body_max_bytes: usize,
    pub startup_healthcheck: bool,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, BoxError> {
        dotenvy::dotenv().ok();
        reject_unknown_keys()?;

        let host = env::var("SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parsed_var("SERVICE_PORT")?.unwrap_or(8080);

        let install_prefix = env_var_non_empty("INSTALL_PREFIX")
            .unwrap_or_else(|| "ARG".to_string())
            .to_ascii_uppercase();
        if install_prefix.len() < 2 || !install_prefix.chars().all(|ch| ch.is_ascii_uppercase()) {
            return Err(format!("invalid INSTALL_PREFIX '{}'", install_prefix).into());
        }
        let install_short_name =
            env_var_non_empty("INSTALL_SHORT_NAME").unwrap_or_else(|| "Support Desk".to_string());
        let timezone_name =
            env_var_non_empty("INSTALL_TIMEZONE").unwrap_or_else(|| "Europe/London".to_string());
        let timezone: Tz = timezone_name
            .parse()
            .map_err(|_| format!("invalid INSTALL_TIMEZONE '{}'", timezone_name))?;

        let outbound_from_addr = env_var_non_empty("OUTBOUND_FROM_ADDR")
            .ok_or("OUTBOUND_FROM_ADDR is required")?
            .to_ascii_lowercase();
        let outbound_cc_addr = env_var_non_empty("OUTBOUND_CC_ADDR");

        let llm = LlmConfig {
            enabled: env_flag("LLM_ENABLED", true),
            api_url: env_var_non_empty("LLM_API_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key: env_var_non_empty("LLM_API_KEY"),
            model: env_var_non_empty("LLM_MODEL").unwrap_or_else(|| "gpt-4.1".to_string()),
            deadline: Duration::from_millis(parsed_var("LLM_DEADLINE_MS")?.unwrap_or(30_000)),
        };

        let store = StoreConfig {
            api_url: env_var_non_empty("STORE_API_URL")
                .unwrap_or_else(|| "https://api.airtable.com/v0".to_string()),
            api_key: env_var_non_empty("STORE_API_KEY").ok_or("STORE_API_KEY is required")?,
            base_id: env_var_non_empty("STORE_BASE_ID").ok_or("STORE_BASE_ID is required")?,
            table: env_var_non_empty("STORE_TABLE").unwrap_or_else(|| "call_log".to_string()),
            deadline: Duration::from_millis(parsed_var("STORE_DEADLINE_MS")?.unwrap_or(10_000)),
            write_qps: parsed_var("STORE_WRITE_QPS")?.unwrap_or(5),
        };
        if store.write_qps == 0 {
            return Err("STORE_WRITE_QPS must be positive".into());
        }

        let mail_api_url = env_var_non_empty("MAIL_API_URL")
            .unwrap_or_else(|| "https://api.sendgrid.com".to_string());
        let mail_api_key = env_var_non_empty("MAIL_API_KEY").ok_or("MAIL_API_KEY is required")?;

        let ack_templates = AckTemplates {
            text: env_var_non_empty("ACK_TEMPLATE_TEXT")
                .unwrap_or_else(|| AckTemplates::default().text),
            html: env_var_non_empty("ACK_TEMPLATE_HTML")
                .unwrap_or_else(|| AckTemplates::default().html),
        };

        Ok(Self {
            host,
            port,
            install_prefix,
            install_short_name,
            timezone,
            outbound_from_addr,
            outbound_cc_addr,
            marker_phrase: env_var_non_empty("ACK_MARKER_PHRASE")
                .unwrap_or_else(|| DEFAULT_MARKER_PHRASE.to_string()),
            llm,
            store,
            mail_api_url,
            mail_api_key,
            mail_deadline: Duration::from_millis(parsed_var("MAIL_DEADLINE_MS")?.unwrap_or(15_000)),
            mail_retries: parsed_var("MAIL_RETRIES")?.unwrap_or(3),
            mail_base_delay: Duration::from_millis(
                parsed_var("MAIL_BASE_DELAY_MS")?.unwrap_or(2_000),
            ),
            dedup_ttl: Duration::from_secs(
                parsed_var::<u64>("DEDUP_TTL_HOURS")?.unwrap_or(168) * 3600,
            ),
            request_deadline: Duration::from_millis(
                parsed_var("REQUEST_DEADLINE_MS")?.unwrap_or(120_000),
            ),
            ack_templates,
            inbound_body_max_bytes: parsed_var("SERVICE_MAX_BODY_BYTES")?
                .unwrap_or(DEFAULT_INBOUND_BODY_MAX_BYTES),
            startup_healthcheck: env_flag("SERVICE_STARTUP_HEALTHCHECK", true),
        })
    }
}

fn reject_unknown_keys() -> Result<(), BoxError> {
    for (key, _) in env::vars() {
        if RECOGNIZED_PREFIXES
            .iter()
            .any(|prefix| key.starts_with(prefix))
            && !RECOGNIZED_KEYS.contains(&key.as_str())
        {
            return Err(format!("unrecognized configuration key {}", key).into());
        }
    }
    Ok(())
}

fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y"
        ),
        Err(_) => default,
    }
}

fn parsed_var<T: std::str::FromStr>(key: &str) -> Result<Option<T>, BoxError> {
    match env_var_non_empty(key) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("invalid value for {}: '{}'", key, value).into()),
        None => Ok(None),
    }
}
