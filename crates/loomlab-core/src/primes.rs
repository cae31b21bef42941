//! Workloads for throughput experiments.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Added to every item before the primality test so small batches still do
/// non-trivial work.
pub const PRIME_OFFSET: u64 = 104_729;

/// Trial division by odd divisors up to the square root.
pub fn is_prime(candidate: u64) -> bool {
    if candidate < 2 {
        return false;
    }
    if candidate == 2 {
        return true;
    }
    if candidate & 1 == 0 {
        return false;
    }
    let mut divisor = 3u64;
    while divisor <= candidate / divisor {
        if candidate % divisor == 0 {
            return false;
        }
        divisor += 2;
    }
    true
}

/// What each task computes from its item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Workload {
    /// `value + value`: next to no work.
    Double,
    /// `value` if `value + PRIME_OFFSET` is prime, else 0.
    #[default]
    Prime,
}

impl Workload {
    pub fn apply(self, value: u64) -> u64 {
        match self {
            Workload::Double => value.wrapping_add(value),
            Workload::Prime => {
                if is_prime(value + PRIME_OFFSET) {
                    value
                } else {
                    0
                }
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Workload::Double => "double",
            Workload::Prime => "prime",
        }
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Workload {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "double" => Ok(Workload::Double),
            "prime" => Ok(Workload::Prime),
            other => Err(format!("unknown workload '{}' (expected double or prime)", other)),
        }
    }
}
