//! Typed handles for the protocol layer: a [`Publisher`] writes to one
//! topic, a [`Subscriber`] consumes from one channel.

mod publisher;
mod subscriber;

pub use publisher::Publisher;
pub use subscriber::Subscriber;
