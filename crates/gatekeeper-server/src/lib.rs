pub mod cache;
pub mod config;
pub mod events;
pub mod gatekeeping;
pub mod http;
pub mod matcher;
pub mod metrics;
pub mod observability;
pub mod server;
pub mod task;

pub use cache::{CounterAggregator, SharedStore, TwoTierCache, create_shared_store};
pub use config::{AppConfig, CacheConfig, GatekeeperMode, RedisConfig, ServerConfig};
pub use events::{ChangeBus, InvalidationListener};
pub use gatekeeping::{GatekeeperError, GatekeepingService, UsageFlusher, ValidationDecision};
pub use matcher::Matcher;
pub use observability::{LogControl, init_tracing};
pub use server::{AppState, GatekeeperServer, ServerBuilder, build_app};
