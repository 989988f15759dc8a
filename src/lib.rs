pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod model;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod trigger;
