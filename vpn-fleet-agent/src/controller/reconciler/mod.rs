pub mod context;
pub mod error;
pub mod peer;
pub mod server;
pub mod status;

#[cfg(test)]
pub(crate) mod fakes;
