pub mod config;
pub mod controllers;
pub mod driver;
pub mod errors;
pub mod gather;
pub mod gatherers;
pub mod protocol;
pub mod quiet_period;
pub mod telemetry;
