//! Student outbox - transactional outbox and at-least-once event delivery
//!
//! Student mutations and the events announcing them commit in one SQLite
//! transaction. A scheduled poller publishes pending events to the broker
//! through a reconnecting transport; acknowledgments and a reconciler close
//! the loop, and a retention purge keeps the table bounded.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod lock;
pub mod model;
pub mod outbox;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub mod test_utils;
