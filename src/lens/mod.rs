pub mod aggregate;
pub mod analysis;
pub mod audit;
pub mod batch;
pub mod chunker;
pub mod config;
pub mod extract;
pub mod paths;
pub mod reset;
pub mod schema;
pub mod store;
pub mod timeparse;
