pub mod result;
pub mod runner;

pub use result::{ResultCode, EXIT_NOT_FOUND, EXIT_USAGE};
pub use runner::Worker;
