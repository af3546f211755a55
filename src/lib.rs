//! # Shutterbus
//!
//! Event routing core of a photo-ingestion pipeline: a pub/sub topic with
//! attribute filters, a retry queue with dead-lettering, a handler pool that
//! grants capabilities, and a change-stream joiner with checkpoints.
//!
//! ## Architecture
//!
//! ```text
//! upload ─▶ ObjectStore ─▶ Notifier ─▶ TopicRouter ─┬─▶ RetryQueue ─▶ QueueConsumer ─▶ Handler
//!                                                   │        └─▶ dead-letter queue ─▶ cleanup Handler
//!                                                   └─▶ direct Handler
//! RecordStore ─▶ ChangeLog ─▶ StreamJoiner ─▶ Handler<ChangeBatch>
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Events and their attribute maps
//! - [`filter`]: Subscription filter policies
//! - [`router`]: Topic fan-out to queues and handlers
//! - [`queue`]: At-least-once queue with leases and redrive
//! - [`dlq`]: Dead-letter records and retention
//! - [`stream`]: Change stream, checkpoints and the joiner
//! - [`pool`]: Handler bindings, capabilities and queue consumers
//! - [`handlers`]: The gallery handlers
//! - [`topology`]: Assembles everything from [`config`]
//! - [`api`]: HTTP surface

pub mod api;
pub mod config;
pub mod dlq;
pub mod event;
pub mod filter;
pub mod handlers;
pub mod mail;
pub mod notifier;
pub mod pool;
pub mod queue;
pub mod router;
pub mod shutdown;
pub mod store;
pub mod stream;
pub mod topology;

// Re-export commonly used types at crate root
pub use config::ShutterbusConfig;
pub use event::{Event, EventId, EventKind};
pub use filter::FilterExpr;
pub use handlers::{Handler, HandlerError, HandlerResult};
pub use queue::RetryQueue;
pub use router::TopicRouter;
pub use topology::Pipeline;
