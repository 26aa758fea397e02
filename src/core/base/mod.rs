pub mod call_error;

pub use self::call_error::*;
