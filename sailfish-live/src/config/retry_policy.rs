// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::Deserialize;
use std::{fmt, time::Duration};

/// Type for the `fragment-retries` config key.
#[derive(Debug, Copy, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "backoff", rename_all = "kebab-case", deny_unknown_fields)]
pub enum RetryPolicy {
    /// Fixed backoff.
    #[serde(rename_all = "kebab-case")]
    Fixed {
        /// Total number of attempts, including the first one.
        attempts: u32,

        /// Delay between attempts.
        #[serde(default, with = "humantime_serde")]
        delay: Duration,

        /// If set to true, randomness will be added to the delay on each retry.
        #[serde(default)]
        jitter: bool,
    },

    /// Exponential backoff.
    #[serde(rename_all = "kebab-case")]
    Exponential {
        /// Total number of attempts, including the first one.
        attempts: u32,

        /// Delay before the first retry. Not optional for exponential backoff.
        #[serde(with = "humantime_serde")]
        delay: Duration,

        /// If set to true, randomness will be added to the delay on each retry.
        #[serde(default)]
        jitter: bool,

        /// If set, limits the delay between attempts.
        #[serde(default, with = "humantime_serde")]
        max_delay: Option<Duration>,
    },
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self::Exponential {
            attempts: 3,
            delay: Duration::from_millis(250),
            jitter: false,
            max_delay: Some(Duration::from_secs(1)),
        }
    }
}

impl RetryPolicy {
    /// Creates a new policy with no delay between attempts.
    pub fn new_without_delay(attempts: u32) -> Self {
        Self::Fixed {
            attempts,
            delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Returns the total number of attempts, including the first one.
    ///
    /// A value of 0 behaves like 1: every fetch is attempted at least once.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fixed { attempts, .. } | Self::Exponential { attempts, .. } => *attempts,
        }
    }
}

pub(super) fn deserialize_retry_policy<'de, D>(deserializer: D) -> Result<RetryPolicy, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct V;

    impl<'de2> serde::de::Visitor<'de2> for V {
        type Value = RetryPolicy;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(
                formatter,
                "a table ({{ attempts = 5, backoff = \"exponential\", delay = \"1s\", max-delay = \"10s\", jitter = true }}) or a number (5)"
            )
        }

        // Note that TOML uses i64, not u64.
        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            let attempts = u32::try_from(v)
                .map_err(|_| E::invalid_value(serde::de::Unexpected::Signed(v), &self))?;
            Ok(RetryPolicy::new_without_delay(attempts))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            let attempts = u32::try_from(v)
                .map_err(|_| E::invalid_value(serde::de::Unexpected::Unsigned(v), &self))?;
            Ok(RetryPolicy::new_without_delay(attempts))
        }

        fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
        where
            A: serde::de::MapAccess<'de2>,
        {
            RetryPolicy::deserialize(serde::de::value::MapAccessDeserializer::new(map))
        }
    }

    // Post-deserialize validation of retry policy.
    let retry_policy = deserializer.deserialize_any(V)?;
    if retry_policy.attempts() == 0 {
        return Err(serde::de::Error::custom(
            "`attempts` must be at least 1 (the first attempt counts)",
        ));
    }
    match &retry_policy {
        RetryPolicy::Fixed { delay, jitter, .. } => {
            // Jitter can't be specified if delay is 0.
            if delay.is_zero() && *jitter {
                return Err(serde::de::Error::custom(
                    "`jitter` cannot be true if `delay` isn't specified or is zero",
                ));
            }
        }
        RetryPolicy::Exponential {
            delay, max_delay, ..
        } => {
            if delay.is_zero() {
                return Err(serde::de::Error::custom(
                    "`delay` cannot be zero with exponential backoff",
                ));
            }
            if max_delay.is_some_and(|f| f.is_zero()) {
                return Err(serde::de::Error::custom(
                    "`max-delay` cannot be zero with exponential backoff",
                ));
            }
            if max_delay.is_some_and(|max_delay| max_delay < *delay) {
                return Err(serde::de::Error::custom(
                    "`max-delay` cannot be less than delay with exponential backoff",
                ));
            }
        }
    }

    Ok(retry_policy)
}
