pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod mjpeg;
pub mod plate_detection;
pub mod results;
pub mod server;
pub mod utils;
