//! Persistent queues
//!
//! The queue manager routes queue names to hosting groups; each group owns
//! a store with transactional enqueue/dequeue, retry-with-delay on
//! rollback, and error-queue parking. Forward workers bridge queues to
//! services under one transaction per message.

pub mod forward;
pub mod group;
pub mod manager;
pub mod store;
