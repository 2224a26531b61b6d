pub mod bridge;
pub mod config;
pub mod engine;
pub mod nht;
pub mod path;
pub mod utils;
pub mod zserv;

pub use bridge::{Bridge, BridgeError, BridgeHandle};
pub use config::BridgeConfig;
