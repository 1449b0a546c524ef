//! Task consumption: delivery loop, per-task dispatch and reconciliation.

pub mod consumer;
pub mod dispatcher;
pub mod reconciler;

pub use consumer::{Delivery, TaskConsumer};
pub use dispatcher::{Disposition, Dispatcher, TaskOutcome};
pub use reconciler::Reconciler;
