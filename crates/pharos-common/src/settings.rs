//! Run settings threaded through every phase call.
//!
//! Settings are produced by the configuration layer and never mutated during a
//! run. The scheduler does not interpret them; the run controllers and the
//! target-preparation code do.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How network and CPU throttling are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottlingMethod {
    /// Throttling is applied later by simulation; the target runs unthrottled.
    #[default]
    Simulate,
    /// Throttling is applied in the browser via the protocol.
    Devtools,
    /// Throttling is applied outside the browser (e.g. by a network shaper).
    Provided,
}

impl std::fmt::Display for ThrottlingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThrottlingMethod::Simulate => write!(f, "simulate"),
            ThrottlingMethod::Devtools => write!(f, "devtools"),
            ThrottlingMethod::Provided => write!(f, "provided"),
        }
    }
}

impl std::str::FromStr for ThrottlingMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simulate" => Ok(ThrottlingMethod::Simulate),
            "devtools" => Ok(ThrottlingMethod::Devtools),
            "provided" => Ok(ThrottlingMethod::Provided),
            _ => anyhow::bail!(
                "Invalid throttling method '{}'. Valid values: simulate, devtools, provided",
                s
            ),
        }
    }
}

/// What to do when the page fails to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadFailureMode {
    /// Record the error and skip artifact collection.
    #[default]
    Fatal,
    /// Record a run warning and collect artifacts anyway.
    Warn,
    /// Collect artifacts anyway without a warning.
    Ignore,
}

impl std::fmt::Display for LoadFailureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadFailureMode::Fatal => write!(f, "fatal"),
            LoadFailureMode::Warn => write!(f, "warn"),
            LoadFailureMode::Ignore => write!(f, "ignore"),
        }
    }
}

impl std::str::FromStr for LoadFailureMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fatal" => Ok(LoadFailureMode::Fatal),
            "warn" => Ok(LoadFailureMode::Warn),
            "ignore" => Ok(LoadFailureMode::Ignore),
            _ => anyhow::bail!(
                "Invalid load failure mode '{}'. Valid values: fatal, warn, ignore",
                s
            ),
        }
    }
}

/// Device class being emulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormFactor {
    #[default]
    Mobile,
    Desktop,
}

/// Network and CPU throttling numbers used by the `devtools` method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottlingSettings {
    #[serde(default = "default_rtt_ms")]
    pub request_latency_ms: f64,
    #[serde(default = "default_download_kbps")]
    pub download_throughput_kbps: f64,
    #[serde(default = "default_upload_kbps")]
    pub upload_throughput_kbps: f64,
    #[serde(default = "default_cpu_slowdown")]
    pub cpu_slowdown_multiplier: f64,
}

fn default_rtt_ms() -> f64 {
    562.5
}

fn default_download_kbps() -> f64 {
    1474.56
}

fn default_upload_kbps() -> f64 {
    675.0
}

fn default_cpu_slowdown() -> f64 {
    4.0
}

impl Default for ThrottlingSettings {
    fn default() -> Self {
        Self {
            request_latency_ms: default_rtt_ms(),
            download_throughput_kbps: default_download_kbps(),
            upload_throughput_kbps: default_upload_kbps(),
            cpu_slowdown_multiplier: default_cpu_slowdown(),
        }
    }
}

/// Screen emulation applied with `Emulation.setDeviceMetricsOverride`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenEmulation {
    #[serde(default = "default_true")]
    pub mobile: bool,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_scale")]
    pub device_scale_factor: f64,
    /// When true, leave the browser's own screen untouched.
    #[serde(default)]
    pub disabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_width() -> u32 {
    412
}

fn default_height() -> u32 {
    823
}

fn default_scale() -> f64 {
    1.75
}

impl Default for ScreenEmulation {
    fn default() -> Self {
        Self {
            mobile: true,
            width: default_width(),
            height: default_height(),
            device_scale_factor: default_scale(),
            disabled: false,
        }
    }
}

/// Settings for a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub throttling_method: ThrottlingMethod,
    #[serde(default)]
    pub throttling: ThrottlingSettings,
    #[serde(default)]
    pub form_factor: FormFactor,
    #[serde(default)]
    pub screen_emulation: ScreenEmulation,
    /// User agent override; `None` keeps the browser's own.
    #[serde(default)]
    pub emulated_user_agent: Option<String>,
    /// Skip clearing storage for the origin before and after navigation.
    #[serde(default)]
    pub disable_storage_reset: bool,
    /// Skip the neutral blank-page navigation before the real one.
    #[serde(default)]
    pub skip_about_blank: bool,
    /// URL of the neutral page loaded during setup.
    #[serde(default = "default_blank_page")]
    pub blank_page: String,
    #[serde(default)]
    pub blocked_url_patterns: Vec<String>,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub load_failure_mode: LoadFailureMode,
    #[serde(default = "default_max_wait_for_fcp_ms")]
    pub max_wait_for_fcp_ms: u64,
    #[serde(default = "default_max_wait_for_load_ms")]
    pub max_wait_for_load_ms: u64,
    #[serde(default = "default_pause_ms")]
    pub pause_after_fcp_ms: u64,
    #[serde(default = "default_pause_ms")]
    pub pause_after_load_ms: u64,
    #[serde(default = "default_pause_ms")]
    pub network_quiet_threshold_ms: u64,
    #[serde(default = "default_pause_ms")]
    pub cpu_quiet_threshold_ms: u64,
}

fn default_blank_page() -> String {
    "about:blank".to_string()
}

fn default_max_wait_for_fcp_ms() -> u64 {
    30_000
}

fn default_max_wait_for_load_ms() -> u64 {
    45_000
}

fn default_pause_ms() -> u64 {
    1_000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            throttling_method: ThrottlingMethod::default(),
            throttling: ThrottlingSettings::default(),
            form_factor: FormFactor::default(),
            screen_emulation: ScreenEmulation::default(),
            emulated_user_agent: None,
            disable_storage_reset: false,
            skip_about_blank: false,
            blank_page: default_blank_page(),
            blocked_url_patterns: Vec::new(),
            extra_headers: BTreeMap::new(),
            load_failure_mode: LoadFailureMode::default(),
            max_wait_for_fcp_ms: default_max_wait_for_fcp_ms(),
            max_wait_for_load_ms: default_max_wait_for_load_ms(),
            pause_after_fcp_ms: default_pause_ms(),
            pause_after_load_ms: default_pause_ms(),
            network_quiet_threshold_ms: default_pause_ms(),
            cpu_quiet_threshold_ms: default_pause_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.throttling_method, ThrottlingMethod::Simulate);
        assert_eq!(settings.load_failure_mode, LoadFailureMode::Fatal);
        assert_eq!(settings.blank_page, "about:blank");
        assert_eq!(settings.max_wait_for_load_ms, 45_000);
        assert!(!settings.disable_storage_reset);
    }

    #[test]
    fn test_settings_partial_toml_fills_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            throttling_method = "devtools"
            blocked_url_patterns = ["*.png"]

            [screen_emulation]
            mobile = false
            width = 1350
            "#,
        )
        .unwrap();

        assert_eq!(settings.throttling_method, ThrottlingMethod::Devtools);
        assert_eq!(settings.blocked_url_patterns, vec!["*.png".to_string()]);
        assert!(!settings.screen_emulation.mobile);
        assert_eq!(settings.screen_emulation.width, 1350);
        assert_eq!(settings.screen_emulation.height, 823);
        assert_eq!(settings.pause_after_load_ms, 1_000);
    }

    #[test]
    fn test_throttling_method_from_str() {
        assert_eq!(
            "DevTools".parse::<ThrottlingMethod>().unwrap(),
            ThrottlingMethod::Devtools
        );
        assert!("fast".parse::<ThrottlingMethod>().is_err());
    }

    #[test]
    fn test_load_failure_mode_from_str() {
        assert_eq!("WARN".parse::<LoadFailureMode>().unwrap(), LoadFailureMode::Warn);
        assert_eq!(LoadFailureMode::Ignore.to_string(), "ignore");
        let err = "loud".parse::<LoadFailureMode>().unwrap_err();
        assert!(err.to_string().contains("Valid values"));
    }
}
