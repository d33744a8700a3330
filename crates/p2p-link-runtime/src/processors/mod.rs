//! Message processors
//!
//! The two stages the message bus consumer drives. Both are synchronous
//! `on_next(batch) -> records` transformations; a failure in one message is
//! logged and never affects the rest of the batch.

pub mod inbound;
pub mod outbound;

pub use inbound::InboundMessageProcessor;
pub use outbound::OutboundMessageProcessor;
