//! RabbitMQ task queue, task envelope and dead-letter reporting.

pub mod broker;
pub mod dead_letter;
pub mod task;

pub use broker::{Broker, DEAD_LETTER_QUEUE, PREFETCH_COUNT, TASK_QUEUE};
pub use dead_letter::{DeadLetterPublisher, DeadLetterRecord, DeadLetterReporter};
pub use task::ImageTask;
