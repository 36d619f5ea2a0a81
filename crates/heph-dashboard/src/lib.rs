pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod http;
pub mod push;
pub mod session;
pub mod subscription;

pub use config::{ConfigOverrides, DashboardConfig};
pub use coordinator::{
    CommandApi, CommandOutcome, MutationCoordinator, PendingCommand, SuggestionAction,
};
pub use engine::{
    ConnectionState, DashboardKpis, FetchDisposition, LoadState, ReadModel, ReconciliationEngine,
};
pub use error::{
    CommandError, ConfigError, FetchError, MutationError, StaleStateError, SubscriptionError,
};
pub use fetch::{
    FetchCompletion, FetchTicket, FetchedRegion, Region, RequestSequencer, SnapshotFetcher,
};
pub use http::HttpBackend;
pub use push::run_push_loop;
pub use session::{DashboardSession, HostEvent, SessionUpdate};
pub use subscription::{subscribe_dashboard_handlers, PushDelivery, PushRouter, Subscription};
