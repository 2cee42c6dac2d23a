pub mod agent;
pub mod capability;
pub mod config;
pub mod error;
pub mod gateway;
pub mod messengers;
pub mod oauth;
pub mod observability;
pub mod providers;
pub mod remote_coder;
pub mod retry;
pub mod rules;
pub mod secret;
pub mod template;
pub mod usage;
pub mod webchat;

pub use error::Error;
