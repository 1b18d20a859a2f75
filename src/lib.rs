pub mod alerts;
pub mod artifact;
pub mod client;
pub mod config;
pub mod enrollment;
pub mod error;
pub mod feed;
pub mod forecast;
pub mod models;
pub mod monitor;
pub mod poller;
pub mod report;
pub mod sites;
pub mod state;
pub mod whatif;

pub use error::{ErrorKind, TrackerError};
