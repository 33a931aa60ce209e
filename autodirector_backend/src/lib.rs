pub mod automation;
pub mod clock;
pub mod config;
pub mod database;
pub mod datastore;
pub mod learning;
pub mod mood;
pub mod runtime;
pub mod server;
