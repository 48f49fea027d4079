//! Request lifecycle controllers: one per request type, each tracking the requests that are in
//!  flight on the current session and mapping each of them to exactly one outcome.

pub mod completion;
pub mod connect_controller;
pub mod request;
pub mod rpc_controller;
