//! TOML config file loading, environment overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::schedule::ScheduleThresholds;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub backend: BackendSection,
    #[serde(default)]
    pub polling: PollingSection,
    pub schedule: ScheduleSection,
    #[serde(default)]
    pub web: WebSection,
    #[serde(default)]
    pub plants: Vec<PlantEntry>,
}

/// Which backend route family to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Per-plant routes: `/plants/{id}/status`, `/plants/{id}/pump`.
    #[default]
    Plants,
    /// Single soil sensor: `/soil/water-level`, `/soil/pump`, `/soil/stream`.
    Soil,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    pub base_url: String,
    /// Defaults to `base_url`.
    #[serde(default)]
    pub forecast_base_url: Option<String>,
    #[serde(default)]
    pub dialect: Dialect,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub live_stream: bool,
    /// Live stream connections silent for longer than this are dropped.
    #[serde(default = "default_stream_idle_ms")]
    pub stream_idle_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingSection {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSection {
    /// Needed water strictly above this is a heavy day. No default: deployments
    /// have used both 4.0 and 5.0.
    pub heavy_threshold_mm: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlantEntry {
    pub plant_id: String,
    pub name: String,
}

fn default_request_timeout_ms() -> u64 {
    7000
}

fn default_stream_idle_ms() -> u64 {
    60_000
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_port() -> u16 {
    8080
}

const MAX_REQUEST_TIMEOUT_MS: u64 = 60_000;

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms)
    }

    pub fn thresholds(&self) -> ScheduleThresholds {
        ScheduleThresholds {
            heavy_threshold_mm: self.schedule.heavy_threshold_mm,
        }
    }

    /// Apply `BACKEND_URL` / `WEB_PORT` overrides. `lookup` is `std::env::var`
    /// in production.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("BACKEND_URL") {
            self.backend.base_url = url;
        }
        if let Some(port) = lookup("WEB_PORT") {
            self.web.port = port
                .trim()
                .parse()
                .with_context(|| format!("WEB_PORT is not a valid port: {port:?}"))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_backend(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_plants(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_backend(&self, errors: &mut Vec<String>) {
        let b = &self.backend;

        if !is_http_url(&b.base_url) {
            errors.push(format!(
                "backend.base_url {:?} must start with http:// or https://",
                b.base_url
            ));
        }
        if let Some(url) = &b.forecast_base_url {
            if !is_http_url(url) {
                errors.push(format!(
                    "backend.forecast_base_url {url:?} must start with http:// or https://"
                ));
            }
        }

        if b.request_timeout_ms == 0 {
            errors.push("backend.request_timeout_ms must be positive".into());
        } else if b.request_timeout_ms > MAX_REQUEST_TIMEOUT_MS {
            errors.push(format!(
                "backend.request_timeout_ms {} exceeds {MAX_REQUEST_TIMEOUT_MS}",
                b.request_timeout_ms
            ));
        }

        if b.stream_idle_ms == 0 {
            errors.push("backend.stream_idle_ms must be positive".into());
        }

        if b.live_stream && b.dialect != Dialect::Soil {
            errors.push("backend.live_stream requires dialect = \"soil\"".into());
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        if self.polling.interval_ms == 0 {
            errors.push("polling.interval_ms must be positive".into());
        }

        let t = self.schedule.heavy_threshold_mm;
        if !t.is_finite() || t <= 0.0 {
            errors.push(format!(
                "schedule.heavy_threshold_mm must be a positive number, got {t}"
            ));
        }

        if self.web.port == 0 {
            errors.push("web.port must not be 0".into());
        }
    }

    fn validate_plants(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, p) in self.plants.iter().enumerate() {
            let ctx = || {
                if p.plant_id.is_empty() {
                    format!("plants[{i}]")
                } else {
                    format!("plant '{}'", p.plant_id)
                }
            };

            if p.plant_id.trim().is_empty() {
                errors.push(format!("{}: plant_id is empty", ctx()));
            } else if !is_path_safe(&p.plant_id) {
                errors.push(format!(
                    "{}: plant_id may only contain letters, digits, '-' and '_'",
                    ctx()
                ));
            } else if !seen_ids.insert(&p.plant_id) {
                errors.push(format!("{}: duplicate plant_id", ctx()));
            }

            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
        }

        // The soil routes address one sensor; more plants would all read it.
        if self.backend.dialect == Dialect::Soil && self.plants.len() > 1 {
            errors.push(format!(
                "dialect \"soil\" tracks a single plant, but {} are configured",
                self.plants.len()
            ));
        }
    }
}

fn is_http_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    rest.is_some_and(|r| !r.is_empty())
}

/// Plant ids are interpolated into URL paths.
fn is_path_safe(id: &str) -> bool {
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, override from the environment, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        plants = config.plants.len(),
        dialect = ?config.backend.dialect,
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_plant(id: &str) -> PlantEntry {
        PlantEntry {
            plant_id: id.into(),
            name: "Tomato".into(),
        }
    }

    fn valid_config() -> Config {
        Config {
            backend: BackendSection {
                base_url: "http://127.0.0.1:5000/api/v1".into(),
                forecast_base_url: None,
                dialect: Dialect::Plants,
                request_timeout_ms: 7000,
                live_stream: false,
                stream_idle_ms: 60_000,
            },
            polling: PollingSection::default(),
            schedule: ScheduleSection {
                heavy_threshold_mm: 4.0,
            },
            web: WebSection::default(),
            plants: vec![valid_plant("tomato-101"), valid_plant("mint-202")],
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[backend]
base_url = "http://localhost:5000/api/v1"
forecast_base_url = "http://localhost:5000/api"
dialect = "plants"
request_timeout_ms = 3000

[polling]
interval_ms = 2500

[schedule]
heavy_threshold_mm = 5.0

[web]
port = 9090

[[plants]]
plant_id = "tomato-101"
name = "Tomato"

[[plants]]
plant_id = "mint-202"
name = "Mint"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backend.dialect, Dialect::Plants);
        assert_eq!(config.request_timeout(), Duration::from_millis(3000));
        assert_eq!(config.poll_interval(), Duration::from_millis(2500));
        assert_eq!(config.thresholds().heavy_threshold_mm, 5.0);
        assert_eq!(config.web.port, 9090);
        assert_eq!(config.plants.len(), 2);
        assert_eq!(
            config.backend.forecast_base_url.as_deref(),
            Some("http://localhost:5000/api")
        );
        config.validate().unwrap();
    }

    #[test]
    fn parse_minimal_config_uses_defaults() {
        let toml_str = r#"
[backend]
base_url = "http://localhost:5000/api/v1"

[schedule]
heavy_threshold_mm = 4.0
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backend.dialect, Dialect::Plants);
        assert_eq!(config.backend.request_timeout_ms, 7000);
        assert!(!config.backend.live_stream);
        assert_eq!(config.backend.stream_idle_ms, 60_000);
        assert_eq!(config.polling.interval_ms, 5000);
        assert_eq!(config.web.port, 8080);
        assert!(config.plants.is_empty());
    }

    #[test]
    fn missing_heavy_threshold_is_parse_error() {
        let toml_str = r#"
[backend]
base_url = "http://localhost:5000/api/v1"

[schedule]
"#;
        let err = toml::from_str::<Config>(toml_str).unwrap_err();
        assert!(err.to_string().contains("heavy_threshold_mm"), "{err}");
    }

    #[test]
    fn soil_dialect_parses() {
        let toml_str = r#"
[backend]
base_url = "http://localhost:5000"
dialect = "soil"
live_stream = true

[schedule]
heavy_threshold_mm = 4.0

[[plants]]
plant_id = "garden"
name = "Garden bed"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backend.dialect, Dialect::Soil);
        config.validate().unwrap();
    }

    // -- Validation: valid configs pass -----------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn no_plants_passes() {
        let mut cfg = valid_config();
        cfg.plants.clear();
        cfg.validate().unwrap();
    }

    // -- Backend ----------------------------------------------------------

    #[test]
    fn base_url_without_scheme_rejected() {
        let mut cfg = valid_config();
        cfg.backend.base_url = "localhost:5000".into();
        assert_validation_err(&cfg, "backend.base_url");
    }

    #[test]
    fn bare_scheme_rejected() {
        let mut cfg = valid_config();
        cfg.backend.base_url = "https://".into();
        assert_validation_err(&cfg, "must start with http:// or https://");
    }

    #[test]
    fn forecast_url_checked_when_present() {
        let mut cfg = valid_config();
        cfg.backend.forecast_base_url = Some("ftp://x".into());
        assert_validation_err(&cfg, "backend.forecast_base_url");
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut cfg = valid_config();
        cfg.backend.request_timeout_ms = 0;
        assert_validation_err(&cfg, "request_timeout_ms must be positive");
    }

    #[test]
    fn huge_timeout_rejected() {
        let mut cfg = valid_config();
        cfg.backend.request_timeout_ms = 120_000;
        assert_validation_err(&cfg, "request_timeout_ms 120000 exceeds 60000");
    }

    #[test]
    fn zero_stream_idle_rejected() {
        let mut cfg = valid_config();
        cfg.backend.stream_idle_ms = 0;
        assert_validation_err(&cfg, "stream_idle_ms must be positive");
    }

    #[test]
    fn live_stream_needs_soil_dialect() {
        let mut cfg = valid_config();
        cfg.backend.live_stream = true;
        assert_validation_err(&cfg, "live_stream requires");
    }

    #[test]
    fn soil_dialect_single_plant_only() {
        let mut cfg = valid_config();
        cfg.backend.dialect = Dialect::Soil;
        assert_validation_err(&cfg, "tracks a single plant, but 2 are configured");
    }

    // -- Timing + thresholds ----------------------------------------------

    #[test]
    fn zero_interval_rejected() {
        let mut cfg = valid_config();
        cfg.polling.interval_ms = 0;
        assert_validation_err(&cfg, "polling.interval_ms must be positive");
    }

    #[test]
    fn non_positive_threshold_rejected() {
        let mut cfg = valid_config();
        cfg.schedule.heavy_threshold_mm = 0.0;
        assert_validation_err(&cfg, "heavy_threshold_mm must be a positive number");

        cfg.schedule.heavy_threshold_mm = f64::NAN;
        assert_validation_err(&cfg, "heavy_threshold_mm must be a positive number");
    }

    #[test]
    fn zero_port_rejected() {
        let mut cfg = valid_config();
        cfg.web.port = 0;
        assert_validation_err(&cfg, "web.port must not be 0");
    }

    // -- Plants -----------------------------------------------------------

    #[test]
    fn empty_plant_id_rejected() {
        let mut cfg = valid_config();
        cfg.plants[0].plant_id = " ".into();
        assert_validation_err(&cfg, "plant_id is empty");
    }

    #[test]
    fn duplicate_plant_id_rejected() {
        let mut cfg = valid_config();
        cfg.plants.push(valid_plant("tomato-101"));
        assert_validation_err(&cfg, "plant 'tomato-101': duplicate plant_id");
    }

    #[test]
    fn plant_id_with_slash_rejected() {
        let mut cfg = valid_config();
        cfg.plants[0].plant_id = "../etc".into();
        assert_validation_err(&cfg, "may only contain letters");
    }

    #[test]
    fn empty_name_rejected() {
        let mut cfg = valid_config();
        cfg.plants[1].name = "".into();
        assert_validation_err(&cfg, "plant 'mint-202': name is empty");
    }

    // -- Environment overrides --------------------------------------------

    #[test]
    fn env_overrides_url_and_port() {
        let mut cfg = valid_config();
        cfg.apply_env(|key| match key {
            "BACKEND_URL" => Some("http://10.0.0.2:5000/api/v1".into()),
            "WEB_PORT" => Some("9000".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.backend.base_url, "http://10.0.0.2:5000/api/v1");
        assert_eq!(cfg.web.port, 9000);
    }

    #[test]
    fn env_bad_port_is_error() {
        let mut cfg = valid_config();
        let err = cfg
            .apply_env(|key| (key == "WEB_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("WEB_PORT"));
    }

    #[test]
    fn env_absent_changes_nothing() {
        let mut cfg = valid_config();
        cfg.apply_env(|_| None).unwrap();
        assert_eq!(cfg.backend.base_url, "http://127.0.0.1:5000/api/v1");
        assert_eq!(cfg.web.port, 8080);
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.backend.base_url = "nope".into();
        cfg.polling.interval_ms = 0;
        cfg.plants[0].name = "".into();

        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "{msg}");
        assert!(msg.contains("backend.base_url"), "{msg}");
        assert!(msg.contains("polling.interval_ms"), "{msg}");
        assert!(msg.contains("name is empty"), "{msg}");
    }
}
