pub mod app;
pub mod client;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod relay;
pub mod store;
pub mod sync;
pub mod types;
