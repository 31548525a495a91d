pub mod client;
pub mod clock;
pub mod server;
pub mod window;
pub mod wire;

pub use client::run_stream;
pub use clock::MonotonicClock;
pub use server::MediaListener;
pub use window::DeliveryWindow;
