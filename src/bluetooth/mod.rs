pub mod client;
#[cfg(test)]
pub mod mock;
pub mod transport;

pub use client::BluerTransport;
pub use transport::Transport;
