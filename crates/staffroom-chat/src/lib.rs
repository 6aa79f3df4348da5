//! Channel membership and message rules layered over the storage gateway.

pub mod error;
pub mod service;

pub use error::{ChatError, ChatResult};
pub use service::ChatService;
