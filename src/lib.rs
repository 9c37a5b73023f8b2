pub mod client;
pub mod config;
pub mod daemon;
pub mod domains;
pub mod error;
pub mod interfaces;
pub mod services;

pub use crate::client::ForemanBot;
pub use crate::config::Config;
pub use crate::domains::message::{Message, MessageType};
pub use crate::error::{ForemanBotError, Result};
