pub mod adapters;
pub mod bus;
pub mod config;
pub mod conversation;
pub mod error;
pub mod http_client;
pub mod memory;
pub mod message;
pub mod model;
pub mod runtime;
