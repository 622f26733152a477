//! Placement configuration.

use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Environment variable for the per-call collaborator timeout.
pub const COLLABORATOR_TIMEOUT_ENV: &str = "ORDERFLOW_COLLABORATOR_TIMEOUT_MS";

/// Environment variable for the redemption compare-and-swap attempts.
pub const REDEMPTION_ATTEMPTS_ENV: &str = "ORDERFLOW_REDEMPTION_ATTEMPTS";

/// Upper bound on a single collaborator call, in milliseconds.
///
/// Must be between 100ms and 60 seconds.
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 60_000),
    default = 5_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct CollaboratorTimeoutMs(u64);

impl CollaboratorTimeoutMs {
    /// Converts to a [`Duration`].
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Compare-and-swap attempts when recording a discount redemption.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    default = 3,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct RedemptionAttempts(u32);

/// Configuration for [`crate::placement::OrderPlacement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Bound applied to every collaborator call.
    pub collaborator_timeout: CollaboratorTimeoutMs,
    /// Attempts to record a redemption before giving up.
    pub redemption_attempts: RedemptionAttempts,
}

impl PlacementConfig {
    /// Loads configuration from the process environment, falling back to
    /// defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(COLLABORATOR_TIMEOUT_ENV) {
            let millis = parse_number(COLLABORATOR_TIMEOUT_ENV, &raw)?;
            config.collaborator_timeout =
                CollaboratorTimeoutMs::try_new(millis).map_err(|error| ConfigError::OutOfRange {
                    key: COLLABORATOR_TIMEOUT_ENV,
                    detail: error.to_string(),
                })?;
        }

        if let Some(raw) = lookup(REDEMPTION_ATTEMPTS_ENV) {
            let attempts = parse_number(REDEMPTION_ATTEMPTS_ENV, &raw)?;
            let attempts = u32::try_from(attempts).map_err(|error| ConfigError::OutOfRange {
                key: REDEMPTION_ATTEMPTS_ENV,
                detail: error.to_string(),
            })?;
            config.redemption_attempts =
                RedemptionAttempts::try_new(attempts).map_err(|error| ConfigError::OutOfRange {
                    key: REDEMPTION_ATTEMPTS_ENV,
                    detail: error.to_string(),
                })?;
        }

        Ok(config)
    }

    /// Builder-style timeout override.
    #[must_use]
    pub const fn with_collaborator_timeout(mut self, timeout: CollaboratorTimeoutMs) -> Self {
        self.collaborator_timeout = timeout;
        self
    }

    /// Builder-style redemption attempts override.
    #[must_use]
    pub const fn with_redemption_attempts(mut self, attempts: RedemptionAttempts) -> Self {
        self.redemption_attempts = attempts;
        self
    }
}

fn parse_number(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::NotANumber {
        key,
        value: raw.to_string(),
    })
}
