//! Postgres wire protocol (v3) subset
//!
//! Only the messages needed for startup, TLS negotiation, authentication,
//! the simple query flow and termination are modelled.

pub mod constants;
pub mod decode;
pub mod encode;
pub mod message;

pub use decode::decode_message;
pub use encode::encode_message;
pub use message::{
    AuthenticationMessage, BackendMessage, ErrorFields, FieldDescription, FrontendMessage,
};
