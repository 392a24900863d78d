//! Typed event fan-out: envelopes, subscriptions, and the bus.

mod bus;
mod envelope;
mod subscription;

pub use bus::{BusConfig, EventBus};
pub use envelope::{Channel, EventEnvelope, EventPayload};
pub use subscription::{DropPolicy, SubscribeOptions, Subscription, SubscriptionFilter};
