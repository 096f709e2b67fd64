pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod fetch;
pub mod http;
pub mod limits;
pub mod model;
pub mod observability;
mod prefetch;
pub mod reconcile;
pub mod time;
pub mod timezone;
pub mod upstream;
