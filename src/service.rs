mod config;
mod pipeline;
mod server;
mod state;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use config::{ServiceConfig, DEFAULT_INBOUND_BODY_MAX_BYTES, DEFAULT_MARKER_PHRASE};
pub use pipeline::process_inbound;
pub use server::{build_router, run_server, ServerError};
pub use state::AppState;
