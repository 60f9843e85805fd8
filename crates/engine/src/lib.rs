//! Dispatch engine: the queue store, the per-entry dispatch claim, the dispatcher and
//! its trigger listener, and the retention sweeper.

pub mod claim;
pub mod dispatcher;
pub mod listener;
pub mod store;
pub mod sweeper;

#[cfg(test)]
mod testing;
