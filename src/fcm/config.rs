/*
 * Copyright (C) 2024 The FCM Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::fcm::logger::LogFormat;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Environment variables understood by the controller manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Config {
    Namespace,
    CreateTimeout,
    HealthTimeout,
    ProgressDeadline,
    SafetyBackoff,
    ImageCacheTtl,
    ResyncInterval,
    ReconcileTimeout,
    Workers,
    ConflictRetries,
    LogFormat,
}

impl Config {
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Namespace => "FCM_NAMESPACE",
            Config::CreateTimeout => "FCM_CREATE_TIMEOUT",
            Config::HealthTimeout => "FCM_HEALTH_TIMEOUT",
            Config::ProgressDeadline => "FCM_PROGRESS_DEADLINE",
            Config::SafetyBackoff => "FCM_SAFETY_BACKOFF",
            Config::ImageCacheTtl => "FCM_IMAGE_CACHE_TTL",
            Config::ResyncInterval => "FCM_RESYNC_INTERVAL",
            Config::ReconcileTimeout => "FCM_RECONCILE_TIMEOUT",
            Config::Workers => "FCM_WORKERS",
            Config::ConflictRetries => "FCM_CONFLICT_RETRIES",
            Config::LogFormat => "FCM_LOG_FORMAT",
        }
    }

    /// Returns the raw value if the variable is set and not blank.
    fn raw(&self) -> Option<String> {
        env::var(self.env_var())
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn duration_or(&self, default: Duration) -> Result<Duration, ConfigError> {
        match self.raw() {
            Some(value) => humantime::parse_duration(&value).map_err(|err| ConfigError::Invalid {
                variable: self.env_var(),
                message: err.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn number_or(&self, default: u32) -> Result<u32, ConfigError> {
        match self.raw() {
            Some(value) => value.parse::<u32>().map_err(|err| ConfigError::Invalid {
                variable: self.env_var(),
                message: err.to_string(),
            }),
            None => Ok(default),
        }
    }
}

/// Runtime settings shared by every controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespace to watch; `None` watches all namespaces.
    pub namespace: Option<String>,
    /// How long a firewall may stay unprovisioned in phase Creating.
    pub create_timeout: Duration,
    /// How long a running firewall may report unhealthy conditions.
    pub health_timeout: Duration,
    /// Time a new set gets to become ready before the deployment reports a stalled rollout.
    pub progress_deadline: Duration,
    /// Minimum spacing between two set creations of the same deployment.
    pub safety_backoff: Duration,
    pub image_cache_ttl: Duration,
    pub resync_interval: Duration,
    pub reconcile_timeout: Duration,
    pub workers: usize,
    pub conflict_retries: u32,
    pub status_retry_base: Duration,
    pub log_format: LogFormat,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            create_timeout: Duration::from_secs(10 * 60),
            health_timeout: Duration::from_secs(20 * 60),
            progress_deadline: Duration::from_secs(15 * 60),
            safety_backoff: Duration::from_secs(10),
            image_cache_ttl: Duration::from_secs(5 * 60),
            resync_interval: Duration::from_secs(10 * 60),
            reconcile_timeout: Duration::from_secs(60),
            workers: 4,
            conflict_retries: 5,
            status_retry_base: Duration::from_millis(50),
            log_format: LogFormat::Text,
        }
    }
}

impl ControllerConfig {
    /// Builds the configuration from `FCM_*` environment variables, using
    /// defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = ControllerConfig::default();
        let log_format = match Config::LogFormat.raw() {
            Some(value) => value
                .parse::<LogFormat>()
                .map_err(|message| ConfigError::Invalid {
                    variable: Config::LogFormat.env_var(),
                    message,
                })?,
            None => defaults.log_format,
        };

        let config = ControllerConfig {
            namespace: Config::Namespace.raw(),
            create_timeout: Config::CreateTimeout.duration_or(defaults.create_timeout)?,
            health_timeout: Config::HealthTimeout.duration_or(defaults.health_timeout)?,
            progress_deadline: Config::ProgressDeadline.duration_or(defaults.progress_deadline)?,
            safety_backoff: Config::SafetyBackoff.duration_or(defaults.safety_backoff)?,
            image_cache_ttl: Config::ImageCacheTtl.duration_or(defaults.image_cache_ttl)?,
            resync_interval: Config::ResyncInterval.duration_or(defaults.resync_interval)?,
            reconcile_timeout: Config::ReconcileTimeout.duration_or(defaults.reconcile_timeout)?,
            workers: Config::Workers.number_or(defaults.workers as u32)? as usize,
            conflict_retries: Config::ConflictRetries.number_or(defaults.conflict_retries)?,
            status_retry_base: defaults.status_retry_base,
            log_format,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            (Config::CreateTimeout, self.create_timeout),
            (Config::HealthTimeout, self.health_timeout),
            (Config::ProgressDeadline, self.progress_deadline),
            (Config::ReconcileTimeout, self.reconcile_timeout),
            (Config::ResyncInterval, self.resync_interval),
        ];
        for (config, value) in non_zero {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    variable: config.env_var(),
                    message: "duration must be greater than zero".to_string(),
                });
            }
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                variable: Config::Workers.env_var(),
                message: "at least one worker is required".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid {
        variable: &'static str,
        message: String,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { variable, message } => {
                write!(f, "invalid value for {}: {}", variable, message)
            }
        }
    }
}

impl Error for ConfigError {}
