//! Caller-side SDK: typed REST calls, a reconnecting gateway session,
//! typing debounce and draft retention.

pub mod api;
pub mod composer;
pub mod gateway;
pub mod typing;

pub use api::ApiClient;
pub use composer::{Composer, MessageSender};
pub use gateway::{GatewaySession, SessionEvent};
pub use typing::{TypingDebouncer, TypingOutbox};
