//! Event fan-out to live observers and the headless handler

pub mod dispatcher;
pub mod types;

pub use dispatcher::{Dispatcher, HeadlessHandler, Observer};
pub use types::{ErrorPayload, Event, EventName};
