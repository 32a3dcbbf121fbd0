//! ForecastLab Core: market records, data sources, feature preparation and trainable forecasters.
//!
//! Nothing in this crate holds pipeline state. The stateful pieces (search, registry,
//! monitoring, retrain trigger, orchestration) live in `forecastlab-runner`.

pub mod data;
pub mod domain;
pub mod features;
pub mod model;
pub mod rng;
