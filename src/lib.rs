pub mod config;
pub mod error;
pub mod geo;
pub mod grid;
pub mod places;
pub mod runner;
pub mod store;
