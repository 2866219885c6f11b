pub mod api;
pub mod frame;
pub mod types;

#[cfg(feature = "client")]
pub mod client;
