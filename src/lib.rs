pub mod caption;
pub mod cli;
pub mod config;
pub mod db;
pub mod drive;
pub mod embedding;
mod metrics;
pub mod registry;
pub mod server;
pub mod utils;

pub use config::Opts;
