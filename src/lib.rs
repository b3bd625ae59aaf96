pub mod app;
pub mod catalogue;
pub mod config;
pub mod domain;
pub mod endpoint;
pub mod error;
pub mod output;
pub mod partition;
pub mod precheck;
pub mod progress;
pub mod reconcile;
pub mod request;
pub mod store;
pub mod submit;
pub mod transfer;
