//! Client-side controller for MRI tumor screening against a remote predictor.

pub mod acquisition;
pub mod config;
pub mod logging;
pub mod monitor;
pub mod predictor;
pub mod server;
pub mod types;
pub mod workflow;

#[cfg(test)]
mod testing;
