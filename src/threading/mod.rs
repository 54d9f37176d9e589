//! Conversation threading for the email-to-ticket gateway.
//!
//! Incoming emails are correlated to tickets through the identifier
//! tokens their headers carry:
//!
//! 1. **Message-ID**: identity of the email itself, the exactly-once guard
//! 2. **References**: the conversation chain, linking replies and forwards
//!    back to the originating ticket
//! 3. **Thread-Index**: Exchange-style conversation marker, decoded into a
//!    stable token when the feature is enabled
//!
//! ## Module structure
//!
//! - `keys`: correlation key extraction from an email's headers
//! - `store`: the persistent `(key, source) → ticket` mapping
//! - `engine`: the per-email decision state machine

pub mod engine;
pub mod keys;
pub mod store;

pub use engine::ThreadingEngine;
pub use keys::{correlation_keys, decode_thread_index, reference_tokens};
pub use store::CorrelationStore;
