pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;
pub mod provider;
pub mod services;
pub mod startup;

pub use error::{AppError, AppResult};
