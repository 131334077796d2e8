//! Admission control and usage metering.

pub mod error;
pub mod flush;
pub mod model;
pub mod service;

pub use error::GatekeeperError;
pub use flush::{CounterSnapshot, FlushReport, UsageFlusher};
pub use model::{UsageRecord, ValidationDecision};
pub use service::GatekeepingService;
