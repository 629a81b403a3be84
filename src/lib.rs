pub mod api;
pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod notify;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;
