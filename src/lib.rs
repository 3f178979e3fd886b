pub mod adapters;
pub mod cli;
pub mod daemon;
pub mod dap;
pub mod error;
pub mod log;
pub mod proto;
pub mod session;

pub use error::Error;
