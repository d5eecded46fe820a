// src/retry/mod.rs
mod strategy;

pub use strategy::{RetryAction, RetryPolicy, RetryState};
