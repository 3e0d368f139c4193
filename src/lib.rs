pub mod bus;
pub mod config;
pub mod control;
pub mod discovery;
pub mod endpoint;
pub mod fdo;
pub mod federation;
pub mod names;
pub mod name_registry;
pub mod peer;
pub mod policy;
pub mod remote;
pub mod router;
pub mod rules;
pub mod session;
pub mod tracing_subscriber;
