pub mod config;
pub mod negotiation;
pub mod signaling;
