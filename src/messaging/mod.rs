//! # Messaging Module
//!
//! Inter-module messaging with dependency enforcement, per-pair FIFO delivery,
//! bounded retry and a dead letter set.
//!
//! ## Architecture
//!
//! ```text
//! send/broadcast ──► admit (registry policy) ──► messages collection
//!                                                   │
//!                                              Scheduler (per-key FIFO,
//!                                              priority-ordered ready keys)
//!                                                   │
//!                                     workers ──► ModuleHandler::handle
//!                                                   │
//!                           delivered / failed / retry ──► dead letters
//! ```

pub mod bus;
pub mod dead_letter;
pub mod errors;
pub mod handler;
pub mod message;
mod scheduler;

pub use bus::{BusStats, MessageBus};
pub use dead_letter::{DeadLetter, DeadLetterStore};
pub use errors::{DeliveryError, DeliveryResult, HandlerError};
pub use handler::{HandlerTable, ModuleHandler};
pub use message::{
    BroadcastReport, DeliveryReceipt, DeliveryStatus, Message, MessageId, MessagePriority,
    MessageSource, OrderingKey, SendOptions,
};
