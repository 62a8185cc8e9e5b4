// src/endpoint/mod.rs
mod descriptor;
mod load;

pub use descriptor::{
    CachePolicy, CacheStrategy, Endpoint, EndpointError, HealthCheckSettings, DEFAULT_GROUP,
};
pub use load::{EndpointLoad, INACTIVE_SCORE_THRESHOLD};
