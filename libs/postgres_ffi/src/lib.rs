pub mod pg_constants;
pub mod xlog_utils;

pub use pg_constants::*;
pub use xlog_utils::*;
