pub mod clock;
pub mod config;
pub mod consumer;
pub mod context;
pub mod distributor;
pub mod errors;
pub mod events;
pub mod intent;
pub mod logging;
pub mod models;
pub mod server;
pub mod service;
pub mod store;
pub mod trigger;
