//! Typed producer/consumer layer over the broker
//!
//! Topics are named `<stage>-<pipeline>-topic`; payloads are JSON envelopes
//! with the image field base64-encoded. Producers key frame traffic by
//! camera id so each camera stays on one partition; consumers run in groups
//! named `<pipeline>-<stage>-<role>` with manual offset commits.

mod admin;
mod consumer;
mod producer;

pub use admin::TopicAdmin;
pub use consumer::{
    ConsumerSettings, MessageConsumer, PolledMessage, RetryLedger, MAX_DELIVERY_ATTEMPTS,
};
pub use producer::MessageProducer;
