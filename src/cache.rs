//! Single-flight token cache: coordination protocol and the state it guards.

pub mod coordinator;
pub(crate) mod state;
