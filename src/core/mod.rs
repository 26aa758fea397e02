pub mod base;
pub mod breaker;

pub use self::base::*;
pub use self::breaker::*;
