pub mod endpoint;

pub use endpoint::Endpoint;
