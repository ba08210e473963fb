pub mod attempt;
pub mod callback;
pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod io;
pub mod paths;
pub mod retry;
pub mod store;

pub use error::{Result, RtcError};
