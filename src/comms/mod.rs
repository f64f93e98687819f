pub mod broker;
pub mod local_api;

pub use broker::{Broker, Subscription};
