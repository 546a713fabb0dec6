//! Gateway adapters

pub mod mock_gateway;

pub use mock_gateway::{GatewayCall, MockGateway};
