//! Outbound side of the pipeline: rendering policy and ordered delivery.

mod render;
mod sink;

pub use render::{ConfiguredPrecision, PrecisionPolicy, apply_precision, last_seen_value, round_to};
pub use sink::{DeliveryQueue, PublishSink};
