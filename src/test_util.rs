//! Fakes for unit tests: a scripted rendezvous server on loopback, socket providers that
//!  simulate platform behavior, and session level doubles.

pub mod fake_rendezvous;
pub mod session;
pub mod sockets;
