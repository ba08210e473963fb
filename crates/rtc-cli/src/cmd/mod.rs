pub mod client;
pub mod config;
pub mod policy;
pub mod serve;
