//! Forward HTTP proxy with a pre-forked worker pool.

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod worker;

pub use config::schema::ProxyConfig;
pub use dispatcher::Dispatcher;
pub use lifecycle::Shutdown;
pub use worker::Worker;
