#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use intake_module::ack::AckTemplates;
use intake_module::llm::LlmConfig;
use intake_module::service::{
    build_router, AppState, ServiceConfig, DEFAULT_INBOUND_BODY_MAX_BYTES, DEFAULT_MARKER_PHRASE,
};
use intake_module::store::StoreConfig;

pub const CONTENT_TYPE_FORM: &str = "multipart/form-data; boundary=xYzZY";

/// Service configuration wired at mock collaborators. `llm_url: None`
/// disables the LLM so every component runs its deterministic fallback.
pub fn test_config(store_url: &str, mail_url: &str, llm_url: Option<&str>) -> ServiceConfig {
    ServiceConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        install_prefix: "ARG".to_string(),
        install_short_name: "Support Desk".to_string(),
        timezone: chrono_tz::Europe::London,
        outbound_from_addr: "desk@ops.example".to_string(),
        outbound_cc_addr: Some("operator@ops.example".to_string()),
        marker_phrase: DEFAULT_MARKER_PHRASE.to_string(),
        llm: LlmConfig {
            enabled: llm_url.is_some(),
            api_url: llm_url.unwrap_or("http://127.0.0.1:1").to_string(),
            api_key: Some("llm-key".to_string()),
            model: "test-model".to_string(),
            deadline: Duration::from_secs(5),
        },
        store: StoreConfig {
            api_url: store_url.to_string(),
            api_key: "store-key".to_string(),
            base_id: "baseX".to_string(),
            table: "tickets".to_string(),
            deadline: Duration::from_secs(5),
            write_qps: 50,
        },
        mail_api_url: mail_url.to_string(),
        mail_api_key: "mail-key".to_string(),
        mail_deadline: Duration::from_secs(5),
        mail_retries: 3,
        mail_base_delay: Duration::from_millis(10),
        dedup_ttl: Duration::from_secs(3600),
        request_deadline: Duration::from_secs(30),
        ack_templates: AckTemplates::default(),
        inbound_body_max_bytes: DEFAULT_INBOUND_BODY_MAX_BYTES,
        startup_healthcheck: false,
    }
}

/// Bind the service on an ephemeral port and return its base URL.
pub async fn spawn_service(config: ServiceConfig) -> String {
    let state = Arc::new(AppState::new(config).expect("service state"));
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{}", addr)
}

/// Build a gateway-shaped multipart body with the default boundary.
pub fn multipart_body(fields: &[(&str, &str)]) -> Vec<u8> {
    let mut out = String::new();
    for (name, value) in fields {
        out.push_str(&format!(
            "--xYzZY\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        ));
    }
    out.push_str("--xYzZY--\r\n");
    out.into_bytes()
}

/// Wrap a structured-output payload in a chat-completion response body.
pub fn chat_completion(content: &serde_json::Value) -> String {
    serde_json::json!({
        "choices": [{"message": {"role": "assistant", "content": content.to_string()}}]
    })
    .to_string()
}

/// Today's allocation date in the installation zone, `YYYYMMDD`.
pub fn today_in_zone() -> String {
    chrono::Utc::now()
        .with_timezone(&chrono_tz::Europe::London)
        .format("%Y%m%d")
        .to_string()
}
