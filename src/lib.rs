pub mod config;
pub mod connector;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod messaging;
pub mod runtime;
pub mod service;
pub mod util;

#[cfg(test)] pub mod test_util;
