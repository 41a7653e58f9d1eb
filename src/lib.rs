#![forbid(unsafe_code)]
#![doc = r#"
Tollgate

Local reverse proxy for the Anthropic messages API with real-time token
usage and cost tracking.

Crate highlights
- Two inbound surfaces: native `/v1/messages` passthrough and an
  OpenAI-compatible `/v1/chat/completions` translation layer; everything
  else is forwarded verbatim.
- SSE-aware streaming: upstream event streams are piped to the client under
  backpressure while usage counters are extracted in flight.
- Every exchange lands in an in-memory ledger with per-model and global
  aggregates, feeding a terminal dashboard or a headless stderr log.

Modules
- `models`: wire types for both protocol surfaces.
- `conversion`: OpenAI ⇄ native request/response/chunk mapping.
- `sse`: line-framed streaming forwarder with side-channel usage capture.
- `server`: actix-web dispatcher, handlers and server lifecycle.
- `pricing` / `ledger`: cost resolution and the request record store.
- `config` / `cli` / `tui` / `util`: configuration, flags, dashboard,
  shared helpers.
"#]

pub mod cli;
pub mod config;
pub mod conversion;
pub mod ledger;
pub mod models;
pub mod pricing;
pub mod server;
pub mod sse;
pub mod tui;
pub mod util;

pub use crate::conversion::{map_stop_reason, to_chat_response, to_messages_request};
pub use crate::ledger::{Ledger, ModelStats, RequestRecord, Summary};
pub use crate::pricing::{ModelPricing, Pricing, PricingTable};
pub use crate::server::{build_http_client, config_routes, AppState};

// Re-export model namespaces for convenience (downstream users can do
// `use tollgate::openai`).
pub use crate::models::{anthropic, openai};
