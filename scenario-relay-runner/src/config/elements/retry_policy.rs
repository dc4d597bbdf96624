// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::Deserialize;
use std::time::Duration;

/// How to retry a failed collector submission.
///
/// `count` is the number of retries after the first attempt, so a policy with
/// `count = 2` makes at most three attempts.
#[derive(Debug, Copy, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "backoff", rename_all = "kebab-case", deny_unknown_fields)]
pub enum RetryPolicy {
    /// Fixed backoff.
    #[serde(rename_all = "kebab-case")]
    Fixed {
        /// Maximum retry count.
        count: u32,

        /// Delay between retries.
        #[serde(default, with = "humantime_serde")]
        delay: Duration,

        /// If set to true, randomness will be added to the delay on each retry attempt.
        #[serde(default)]
        jitter: bool,
    },

    /// Exponential backoff: the delay doubles after every retry.
    #[serde(rename_all = "kebab-case")]
    Exponential {
        /// Maximum retry count.
        count: u32,

        /// Delay before the first retry. Not optional for exponential backoff.
        #[serde(with = "humantime_serde")]
        delay: Duration,

        /// If set to true, randomness will be added to the delay on each retry attempt.
        #[serde(default)]
        jitter: bool,

        /// If set, limits the delay between retries.
        #[serde(default, with = "humantime_serde")]
        max_delay: Option<Duration>,
    },
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self::new_without_delay(0)
    }
}

impl RetryPolicy {
    /// Create new policy with no delay between retries.
    pub fn new_without_delay(count: u32) -> Self {
        Self::Fixed {
            count,
            delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Create a new exponential policy without jitter or a delay ceiling.
    pub fn exponential(count: u32, delay: Duration) -> Self {
        Self::Exponential {
            count,
            delay,
            jitter: false,
            max_delay: None,
        }
    }

    /// Returns the number of retries.
    pub fn count(&self) -> u32 {
        match self {
            Self::Fixed { count, .. } | Self::Exponential { count, .. } => *count,
        }
    }

    /// Returns the delays to wait before each retry, in order.
    pub fn backoff(&self) -> BackoffIter {
        BackoffIter::new(*self)
    }
}

/// Iterator over the delays of a [`RetryPolicy`].
///
/// Yields exactly [`RetryPolicy::count`] items.
#[derive(Debug)]
pub struct BackoffIter {
    policy: RetryPolicy,
    current_factor: f64,
    remaining_attempts: u32,
}

impl BackoffIter {
    const BACKOFF_EXPONENT: f64 = 2.;

    fn new(policy: RetryPolicy) -> Self {
        let remaining_attempts = policy.count();
        Self {
            policy,
            current_factor: 1.,
            remaining_attempts,
        }
    }

    fn next_delay_and_jitter(&mut self) -> (Duration, bool) {
        match self.policy {
            RetryPolicy::Fixed { delay, jitter, .. } => (delay, jitter),
            RetryPolicy::Exponential {
                delay,
                jitter,
                max_delay,
                ..
            } => {
                let factor = self.current_factor;
                let exp_delay = delay.mul_f64(factor);

                // Stop multiplying the exponential factor if delay is greater than max_delay.
                if let Some(max_delay) = max_delay
                    && exp_delay > max_delay
                {
                    return (max_delay, jitter);
                }

                self.current_factor *= Self::BACKOFF_EXPONENT;

                (exp_delay, jitter)
            }
        }
    }

    fn apply_jitter(duration: Duration) -> Duration {
        // random() is in [0, 1), so this lands in (0.5, 1].
        let jitter = 1. - rand::random::<f64>();
        duration.mul_f64(0.5 + jitter / 2.)
    }
}

impl Iterator for BackoffIter {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining_attempts > 0 {
            let (mut delay, jitter) = self.next_delay_and_jitter();
            if jitter {
                delay = Self::apply_jitter(delay);
            }
            self.remaining_attempts -= 1;
            Some(delay)
        } else {
            None
        }
    }
}

impl RetryPolicy {
    /// Checks the combinations serde can't express.
    fn validate(&self) -> Result<(), &'static str> {
        match *self {
            Self::Fixed { delay, jitter, .. } if jitter && delay.is_zero() => {
                Err("`jitter` requires a non-zero `delay`")
            }
            Self::Fixed { .. } => Ok(()),
            Self::Exponential {
                count,
                delay,
                max_delay,
                ..
            } => {
                if count == 0 {
                    Err("exponential backoff needs `count` of at least 1")
                } else if delay.is_zero() {
                    Err("exponential backoff needs a non-zero `delay`")
                } else if max_delay.is_some_and(|max_delay| max_delay < delay) {
                    Err("`max-delay` must be at least `delay`")
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Reads a `{ backoff, count, ... }` table and rejects contradictory settings.
pub(in crate::config) fn deserialize_retry_policy<'de, D>(
    deserializer: D,
) -> Result<RetryPolicy, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let policy = RetryPolicy::deserialize(deserializer)?;
    policy.validate().map_err(serde::de::Error::custom)?;
    Ok(policy)
}
