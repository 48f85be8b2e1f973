pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod harness;
pub mod monitor;
pub mod relay;
pub mod sandbox;
pub mod verdict;

pub use error::{JudgeletError, Result};
pub use harness::{ExecutionRequest, Harness};
pub use verdict::{Verdict, VerdictKind};
