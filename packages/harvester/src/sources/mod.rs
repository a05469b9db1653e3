//! Message-source implementations.

pub mod gateway;

pub use gateway::{GatewayConnector, GatewaySource};
