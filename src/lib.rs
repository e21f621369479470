//! Point-to-point reliable delivery between one logical producer and one
//! logical consumer, mediated by a [producer::ProducerControllerRef] /
//! [consumer::ConsumerControllerRef] pair over a potentially lossy, reordering
//! transport.
//!
//! ## Guarantees
//!
//! * in-order, gap-free delivery to the consumer, numbered from 1
//! * window based flow control: the producer never sends beyond what the
//!   consumer requested, except an epoch's first message
//! * at-least-once with deduplication: lost messages are retransmitted on
//!   demand, duplicates are discarded
//! * optional durable producer queue: messages are persisted before they count
//!   as sent, so a crashed producer resumes where it left off
//! * dynamic re-binding: either controller can be replaced at runtime without
//!   loss
//!
//! Consumers may still observe duplicates around producer re-binding and must
//! be idempotent; exactly-once is explicitly not provided.
//!
//! ## Shape
//!
//! Each controller is a tokio task processing one inbox message at a time.
//! The application producer is driven by a one-at-a-time
//! [producer::RequestNext] handshake; the application consumer receives one
//! [consumer::Delivery] at a time and confirms each. The sharding wrappers
//! fan a producer out to many entities and fan many producers in to one
//! consumer.

pub mod config;
pub mod consumer;
pub mod durable_queue;
pub mod messages;
pub mod producer;
pub mod refs;
pub mod sharding;
pub mod wire_messages;

#[cfg(test)]
mod delivery_tests;
#[cfg(test)]
mod test_util;
