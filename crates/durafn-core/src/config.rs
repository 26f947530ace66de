// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine settings.
//!
//! All tunables live in one [`Settings`] value injected at engine
//! construction; no component reads ambient global state. A zero check
//! frequency disables the corresponding watchdog permanently.

use std::time::Duration;

/// Tunables for the recovery and coordination engine.
#[derive(Debug, Clone)]
pub struct Settings {
    /// How often the crashed watchdog compares heartbeat snapshots.
    /// Zero disables crash detection for all registered function types.
    pub crashed_check_frequency: Duration,
    /// How often the postponed watchdog scans for due functions; also the
    /// lookahead window of each scan. Zero disables postponed retries.
    pub postponed_check_frequency: Duration,
    /// Delay before the postponed watchdog starts polling.
    pub delay_startup: Duration,
    /// Period of the executor heartbeat while user code runs.
    pub sign_of_life_frequency: Duration,
    /// Upper bound on concurrently running reinvocations, applied to the
    /// crashed watchdog's work queue and the postponed watchdog's permit
    /// pool alike.
    pub max_parallel_reinvocations: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            crashed_check_frequency: Duration::from_secs(10),
            postponed_check_frequency: Duration::from_secs(10),
            delay_startup: Duration::ZERO,
            sign_of_life_frequency: Duration::from_secs(5),
            max_parallel_reinvocations: 10,
        }
    }
}

impl Settings {
    /// Load settings from environment variables.
    ///
    /// All variables are optional; unset variables keep their defaults.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DURAFN_CRASHED_CHECK_FREQUENCY_MS` | `10000` | Crash-detection poll interval (0 disables) |
    /// | `DURAFN_POSTPONED_CHECK_FREQUENCY_MS` | `10000` | Postponed poll interval and lookahead (0 disables) |
    /// | `DURAFN_DELAY_STARTUP_MS` | `0` | Postponed watchdog startup delay |
    /// | `DURAFN_SIGN_OF_LIFE_FREQUENCY_MS` | `5000` | Executor heartbeat period |
    /// | `DURAFN_MAX_PARALLEL_REINVOCATIONS` | `10` | Reinvocation concurrency bound |
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            crashed_check_frequency: env_duration_ms(
                "DURAFN_CRASHED_CHECK_FREQUENCY_MS",
                defaults.crashed_check_frequency,
            )?,
            postponed_check_frequency: env_duration_ms(
                "DURAFN_POSTPONED_CHECK_FREQUENCY_MS",
                defaults.postponed_check_frequency,
            )?,
            delay_startup: env_duration_ms("DURAFN_DELAY_STARTUP_MS", defaults.delay_startup)?,
            sign_of_life_frequency: env_duration_ms(
                "DURAFN_SIGN_OF_LIFE_FREQUENCY_MS",
                defaults.sign_of_life_frequency,
            )?,
            max_parallel_reinvocations: env_usize(
                "DURAFN_MAX_PARALLEL_REINVOCATIONS",
                defaults.max_parallel_reinvocations,
            )?,
        })
    }
}

fn env_duration_ms(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::Invalid(name, "must be a non-negative integer (ms)")),
    }
}

fn env_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse::<usize>()
            .map_err(|_| ConfigError::Invalid(name, "must be a non-negative integer")),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
