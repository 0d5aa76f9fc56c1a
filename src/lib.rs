pub mod anchor;
pub mod backoff;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keeper;
pub mod merkle;
pub mod server;
pub mod store;

#[cfg(test)]
mod testing;
