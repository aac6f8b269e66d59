//! Executable participants of the request/response protocol

pub mod client;
pub mod server;
