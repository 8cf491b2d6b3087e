pub mod broker;
pub mod connection;
pub mod tasks;

pub use broker::{Broker, ConnectionId, Delivery, DeliveryReceiver};
pub use connection::GatewayContext;
