//! Protocol backend implementations.
//!
//! Production deployments wrap the external cryptography library behind
//! [`crate::driver::ProtocolBackend`]; this module ships a deterministic
//! simulated backend used by tests, demos and the party CLI's rehearsal mode.

pub mod sim;

pub use sim::SimBackend;
