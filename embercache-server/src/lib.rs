//! Embercache server - an HTTP cache node exposing the `/cache/{key}`
//! admission protocol over the core storage engine and promise map.

pub mod config;
pub mod error;
pub mod server;

pub use config::Config;
pub use error::{Result, ServerError};
pub use server::{build_router, build_state, run_server, ServerState};
