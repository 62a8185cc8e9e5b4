// src/lib.rs
pub mod cache;
pub mod config;
pub mod endpoint;
pub mod events;
pub mod failover;
pub mod health;
pub mod load_balancer;
pub mod metrics;
