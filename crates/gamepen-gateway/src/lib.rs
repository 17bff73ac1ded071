pub mod connection;
pub mod dispatcher;
pub mod handler;
pub mod presence;
pub mod routes;

pub use handler::Gateway;
pub use routes::{GatewayState, routes};
