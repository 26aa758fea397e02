use crate::Error;
use serde::{Deserialize, Serialize};
use serde_json;
use std::fmt;

/// Rule encompasses the parameters of a breaker guarding one operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct Rule {
    /// name of the protected operation, used for logging and listeners
    pub resource: String,
    /// `max_failures` represents the threshold of consecutive failures.
    /// Once reached, the breaker trips and rejects calls outright.
    pub max_failures: u32,
    /// `retry_timeout_ms` represents recovery timeout (in milliseconds) after the breaker opens.
    /// During the open period, no calls are permitted until the timeout has elapsed.
    /// After that, the breaker admits a single "trial" call to test recovery.
    pub retry_timeout_ms: u32,
}

impl Default for Rule {
    fn default() -> Self {
        Rule {
            resource: String::default(),
            max_failures: 0,
            retry_timeout_ms: 0,
        }
    }
}

impl Rule {
    pub fn is_valid(&self) -> crate::Result<()> {
        if self.resource.is_empty() {
            return Err(Error::msg("empty resource name"));
        }
        if self.max_failures == 0 {
            return Err(Error::msg("invalid max_failures"));
        }
        if self.retry_timeout_ms == 0 {
            return Err(Error::msg("invalid retry_timeout_ms"));
        }
        Ok(())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmtted = serde_json::to_string_pretty(self).unwrap();
        write!(f, "{}", fmtted)
    }
}
