//! Event publisher adapters.
//!
//! - `InMemoryEventBus` - Captures notifications for tests
//! - `TracingEventPublisher` - Emits notifications as structured log lines

mod in_memory;
mod tracing_publisher;

pub use in_memory::InMemoryEventBus;
pub use tracing_publisher::TracingEventPublisher;
