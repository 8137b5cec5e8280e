pub mod client;
pub mod health;

pub use client::{
    compose_url, HttpUpstreamClient, UpstreamClient, UpstreamRequest, UpstreamResponse,
};
pub use health::{HealthEntry, HealthProbe, HealthRegistry, HttpHealthProbe};
