pub mod abi;
pub mod chain;
pub mod channel;
mod client;
pub mod config;
pub mod consensus;
pub mod engine;
pub mod messages;
pub mod payments;
pub mod protocols;
pub mod query;
pub mod sig;
pub mod store;
pub mod types;
pub mod wire;

pub use client::{ClientError, NitroClient};
pub use engine::{Engine, EngineError, EngineEvent};
pub use types::{Address, Destination, Hash, Signature, U256};
