//! Delivery of stored samples to the remote collector

pub mod engine;
pub mod template;
pub mod transport;

pub use engine::{SyncEngine, SyncReport, SyncTrigger};
pub use template::{render_batch, render_location};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, TransportError, UreqTransport};
