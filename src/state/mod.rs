//! Last-known entity state and the property-map primitives it is built on.

pub mod cache;
pub mod filter;
pub mod merge;

pub use cache::{DeviceRegistry, KeepAll, StateCache, StateChange};
pub use filter::KeyFilter;
pub use merge::Properties;
