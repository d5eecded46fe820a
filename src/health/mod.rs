// src/health/mod.rs
mod checker;
mod probe;

pub use checker::HealthChecker;
pub use probe::{create_probe, HealthProbe, HttpProbe, ProbeResult, TcpProbe};
