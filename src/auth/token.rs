//! Token models exchanged with the identity provider and connecting clients.

pub mod client;
pub mod secret;
pub mod service;
