pub mod analysis;
pub mod config;
pub mod gitlab;
pub mod resources;
