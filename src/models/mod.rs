//! Wire types for the two inbound surfaces.
//!
//! `openai` holds the chat-completion shapes served to clients on
//! `/v1/chat/completions`; `anthropic` holds the native messages shapes
//! spoken to the upstream. Translation between the two lives in
//! `crate::conversion`.

pub mod anthropic;
pub mod openai;
