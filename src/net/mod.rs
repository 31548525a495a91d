pub mod endpoint;
pub mod factory;

pub use endpoint::{resolve, Endpoint};
pub use factory::{NetSocketFactory, SocketFactory};
