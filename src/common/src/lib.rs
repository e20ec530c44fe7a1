pub mod cli;
pub mod config;
pub mod model;
pub mod net;

pub use model::Endpoint;
