use std::sync::Arc;

use crate::ack::{AckConfig, AckSender};
use crate::classifier::Classifier;
use crate::dedupe::DedupGate;
use crate::extractors::Extractors;
use crate::llm::LlmClient;
use crate::loop_guard::LoopGuard;
use crate::store::TicketStore;
use crate::thread_parser::ThreadParser;
use crate::ticket::TicketAllocator;

use super::config::ServiceConfig;
use super::BoxError;

/// Shared service state handed to every webhook task.
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub dedupe: Arc<DedupGate>,
    pub loop_guard: LoopGuard,
    pub classifier: Classifier,
    pub extractors: Extractors,
    pub thread_parser: ThreadParser,
    pub allocator: TicketAllocator,
    pub store: Arc<TicketStore>,
    pub ack: AckSender,
    pub llm: Arc<LlmClient>,
}

impl AppState {
    pub fn new(config: ServiceConfig) -> Result<Self, BoxError> {
        let config = Arc::new(config);
        let llm = Arc::new(LlmClient::new(config.llm.clone()));
        let store = Arc::new(TicketStore::new(config.store.clone()));

        let classifier = Classifier::new(llm.clone(), &config.install_prefix)?;
        let loop_guard = LoopGuard::new(
            &config.outbound_from_addr,
            &config.install_prefix,
            &config.install_short_name,
            &config.marker_phrase,
        )?;
        let ack = AckSender::new(
            AckConfig {
                api_url: config.mail_api_url.clone(),
                api_key: config.mail_api_key.clone(),
                from_addr: config.outbound_from_addr.clone(),
                cc_addr: config.outbound_cc_addr.clone(),
                short_name: config.install_short_name.clone(),
                retries: config.mail_retries,
                base_delay: config.mail_base_delay,
                deadline: config.mail_deadline,
            },
            config.ack_templates.clone(),
        );

        Ok(Self {
            dedupe: Arc::new(DedupGate::new(config.dedup_ttl)),
            loop_guard,
            classifier,
            extractors: Extractors::new(llm.clone()),
            thread_parser: ThreadParser::new(llm.clone(), config.timezone),
            allocator: TicketAllocator::new(
                store.clone(),
                config.install_prefix.clone(),
                config.timezone,
            ),
            store,
            ack,
            llm,
            config,
        })
    }
}
