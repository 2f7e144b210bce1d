pub mod config;
pub mod error;
pub mod security;
pub mod shutdown;
pub mod types;
