pub mod common;
pub mod connector;
pub mod domain;

pub use common::error::{EtlError, Result};
pub use domain::*;
