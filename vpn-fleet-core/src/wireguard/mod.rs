pub mod interface;
pub mod keys;
pub mod peer_config;
pub mod server_config;

#[cfg(any(test, feature = "testing"))]
pub mod memory;
