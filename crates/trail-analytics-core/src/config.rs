// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Layered configuration for the analytics pipeline and the GA4 adapter.
//!
//! Layers are merged lowest to highest precedence: built-in defaults, a TOML
//! file, then `TRAIL_ANALYTICS_*` environment variables. `finalize` applies
//! defaults to whatever no layer set.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

const DEFAULT_BUFFER_SIZE: usize = 10;
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_OFFLINE_EVENTS: usize = 100;
const DEFAULT_OFFLINE_STORAGE_KEY: &str = "analytics_offline_data";
const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_GEO_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_MAX_ERROR_EVENTS: u32 = 10;
const DEFAULT_INTERACTION_GATE_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BEACON_PATH: &str = "/analytics/beacon";

const DEFAULT_GA4_ENDPOINT: &str = "https://www.google-analytics.com/mp/collect";
const DEFAULT_GA4_FLUSH_INTERVAL_SECS: u64 = 10;
const DEFAULT_GA4_QUEUE_CAPACITY: usize = 500;

pub const ENV_PREFIX: &str = "TRAIL_ANALYTICS_";

fn default_sections() -> Vec<String> {
	["page-top", "publications", "awards", "service"]
		.into_iter()
		.map(String::from)
		.collect()
}

fn default_scroll_depth_thresholds() -> Vec<u8> {
	vec![25, 50, 75, 100]
}

/// Configuration layer for the analytics pipeline (all fields optional for merging).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsConfigLayer {
	pub enabled: Option<bool>,
	pub respect_do_not_track: Option<bool>,
	/// Collection endpoint for batched events. Batches are only logged when unset.
	pub endpoint: Option<String>,
	pub beacon_url: Option<String>,
	pub buffer_size: Option<usize>,
	pub flush_interval_secs: Option<u64>,
	pub max_retries: Option<u32>,
	pub retry_base_delay_ms: Option<u64>,
	pub max_offline_events: Option<usize>,
	pub offline_storage_key: Option<String>,
	pub session_timeout_secs: Option<u64>,
	pub sections: Option<Vec<String>>,
	pub scroll_depth_thresholds: Option<Vec<u8>>,
	pub anonymize_ip: Option<bool>,
	pub mask_user_agent: Option<bool>,
	pub geo_lookup: Option<bool>,
	pub geo_timeout_ms: Option<u64>,
	pub max_error_events: Option<u32>,
	pub interaction_gate_timeout_ms: Option<u64>,
	pub request_timeout_secs: Option<u64>,
}

macro_rules! merge_fields {
	($self:ident, $other:ident, $($field:ident),+ $(,)?) => {
		$(
			if $other.$field.is_some() {
				$self.$field = $other.$field;
			}
		)+
	};
}

impl AnalyticsConfigLayer {
	/// Merge another layer into this one. Other layer takes precedence.
	pub fn merge(&mut self, other: Self) {
		merge_fields!(
			self,
			other,
			enabled,
			respect_do_not_track,
			endpoint,
			beacon_url,
			buffer_size,
			flush_interval_secs,
			max_retries,
			retry_base_delay_ms,
			max_offline_events,
			offline_storage_key,
			session_timeout_secs,
			sections,
			scroll_depth_thresholds,
			anonymize_ip,
			mask_user_agent,
			geo_lookup,
			geo_timeout_ms,
			max_error_events,
			interaction_gate_timeout_ms,
			request_timeout_secs,
		);
	}

	/// Convert to resolved configuration with defaults applied.
	pub fn finalize(self) -> AnalyticsConfig {
		AnalyticsConfig {
			enabled: self.enabled.unwrap_or(true),
			respect_do_not_track: self.respect_do_not_track.unwrap_or(true),
			endpoint: self.endpoint,
			beacon_url: self.beacon_url,
			buffer_size: self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
			flush_interval_secs: self.flush_interval_secs.unwrap_or(DEFAULT_FLUSH_INTERVAL_SECS),
			max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
			retry_base_delay_ms: self.retry_base_delay_ms.unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS),
			max_offline_events: self.max_offline_events.unwrap_or(DEFAULT_MAX_OFFLINE_EVENTS),
			offline_storage_key: self
				.offline_storage_key
				.unwrap_or_else(|| DEFAULT_OFFLINE_STORAGE_KEY.to_string()),
			session_timeout_secs: self
				.session_timeout_secs
				.unwrap_or(DEFAULT_SESSION_TIMEOUT_SECS),
			sections: self.sections.unwrap_or_else(default_sections),
			scroll_depth_thresholds: self
				.scroll_depth_thresholds
				.unwrap_or_else(default_scroll_depth_thresholds),
			anonymize_ip: self.anonymize_ip.unwrap_or(false),
			mask_user_agent: self.mask_user_agent.unwrap_or(false),
			geo_lookup: self.geo_lookup.unwrap_or(true),
			geo_timeout_ms: self.geo_timeout_ms.unwrap_or(DEFAULT_GEO_TIMEOUT_MS),
			max_error_events: self.max_error_events.unwrap_or(DEFAULT_MAX_ERROR_EVENTS),
			interaction_gate_timeout_ms: self
				.interaction_gate_timeout_ms
				.unwrap_or(DEFAULT_INTERACTION_GATE_TIMEOUT_MS),
			request_timeout_secs: self
				.request_timeout_secs
				.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
		}
	}
}

/// Resolved analytics pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsConfig {
	pub enabled: bool,
	pub respect_do_not_track: bool,
	pub endpoint: Option<String>,
	pub beacon_url: Option<String>,
	pub buffer_size: usize,
	pub flush_interval_secs: u64,
	pub max_retries: u32,
	pub retry_base_delay_ms: u64,
	pub max_offline_events: usize,
	pub offline_storage_key: String,
	pub session_timeout_secs: u64,
	pub sections: Vec<String>,
	pub scroll_depth_thresholds: Vec<u8>,
	pub anonymize_ip: bool,
	pub mask_user_agent: bool,
	pub geo_lookup: bool,
	pub geo_timeout_ms: u64,
	pub max_error_events: u32,
	pub interaction_gate_timeout_ms: u64,
	pub request_timeout_secs: u64,
}

impl Default for AnalyticsConfig {
	fn default() -> Self {
		AnalyticsConfigLayer::default().finalize()
	}
}

impl AnalyticsConfig {
	pub fn flush_interval(&self) -> Duration {
		Duration::from_secs(self.flush_interval_secs)
	}

	pub fn retry_base_delay(&self) -> Duration {
		Duration::from_millis(self.retry_base_delay_ms)
	}

	pub fn session_timeout(&self) -> Duration {
		Duration::from_secs(self.session_timeout_secs)
	}

	pub fn geo_timeout(&self) -> Duration {
		Duration::from_millis(self.geo_timeout_ms)
	}

	pub fn interaction_gate_timeout(&self) -> Duration {
		Duration::from_millis(self.interaction_gate_timeout_ms)
	}

	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}

	/// The beacon URL: explicit, or the beacon path on the endpoint's origin.
	pub fn resolved_beacon_url(&self) -> Option<String> {
		if let Some(url) = &self.beacon_url {
			return Some(url.clone());
		}
		let endpoint = self.endpoint.as_deref()?;
		let scheme_end = endpoint.find("://")? + 3;
		let origin_end = endpoint[scheme_end..]
			.find('/')
			.map(|i| scheme_end + i)
			.unwrap_or(endpoint.len());
		Some(format!("{}{}", &endpoint[..origin_end], DEFAULT_BEACON_PATH))
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.buffer_size == 0 {
			return Err(ConfigError::invalid_value("buffer_size", "must be at least 1"));
		}
		if self.flush_interval_secs == 0 {
			return Err(ConfigError::invalid_value(
				"flush_interval_secs",
				"must be at least 1",
			));
		}
		if self.max_offline_events == 0 {
			return Err(ConfigError::invalid_value(
				"max_offline_events",
				"must be at least 1",
			));
		}
		if self.sections.is_empty() {
			return Err(ConfigError::invalid_value("sections", "must not be empty"));
		}
		if let Some(bad) = self
			.scroll_depth_thresholds
			.iter()
			.find(|t| **t == 0 || **t > 100)
		{
			return Err(ConfigError::invalid_value(
				"scroll_depth_thresholds",
				format!("{bad} is outside 1..=100"),
			));
		}
		Ok(())
	}
}

/// Configuration layer for the GA4 adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Ga4ConfigLayer {
	pub enabled: Option<bool>,
	pub measurement_id: Option<String>,
	pub api_secret: Option<String>,
	pub endpoint: Option<String>,
	pub flush_interval_secs: Option<u64>,
	pub queue_capacity: Option<usize>,
}

impl Ga4ConfigLayer {
	pub fn merge(&mut self, other: Self) {
		merge_fields!(
			self,
			other,
			enabled,
			measurement_id,
			api_secret,
			endpoint,
			flush_interval_secs,
			queue_capacity,
		);
	}

	pub fn finalize(self) -> Ga4Config {
		Ga4Config {
			enabled: self.enabled.unwrap_or(false),
			measurement_id: self.measurement_id,
			api_secret: self.api_secret,
			endpoint: self
				.endpoint
				.unwrap_or_else(|| DEFAULT_GA4_ENDPOINT.to_string()),
			flush_interval_secs: self
				.flush_interval_secs
				.unwrap_or(DEFAULT_GA4_FLUSH_INTERVAL_SECS),
			queue_capacity: self.queue_capacity.unwrap_or(DEFAULT_GA4_QUEUE_CAPACITY),
		}
	}
}

/// Resolved GA4 adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ga4Config {
	pub enabled: bool,
	pub measurement_id: Option<String>,
	pub api_secret: Option<String>,
	pub endpoint: String,
	pub flush_interval_secs: u64,
	pub queue_capacity: usize,
}

impl Default for Ga4Config {
	fn default() -> Self {
		Ga4ConfigLayer::default().finalize()
	}
}

impl Ga4Config {
	pub fn flush_interval(&self) -> Duration {
		Duration::from_secs(self.flush_interval_secs)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if !self.enabled {
			return Ok(());
		}
		if self.measurement_id.as_deref().map_or(true, str::is_empty) {
			return Err(ConfigError::validation(
				"ga4.measurement_id is required when GA4 is enabled",
			));
		}
		if self.api_secret.as_deref().map_or(true, str::is_empty) {
			return Err(ConfigError::validation(
				"ga4.api_secret is required when GA4 is enabled",
			));
		}
		if self.queue_capacity == 0 {
			return Err(ConfigError::invalid_value("ga4.queue_capacity", "must be at least 1"));
		}
		Ok(())
	}
}

/// The full configuration file, one table per component.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrailConfigLayer {
	pub analytics: AnalyticsConfigLayer,
	pub ga4: Ga4ConfigLayer,
}

impl TrailConfigLayer {
	pub fn merge(&mut self, other: Self) {
		self.analytics.merge(other.analytics);
		self.ga4.merge(other.ga4);
	}

	pub fn finalize(self) -> TrailConfig {
		TrailConfig {
			analytics: self.analytics.finalize(),
			ga4: self.ga4.finalize(),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrailConfig {
	pub analytics: AnalyticsConfig,
	pub ga4: Ga4Config,
}

impl TrailConfig {
	pub fn validate(&self) -> Result<(), ConfigError> {
		self.analytics.validate()?;
		self.ga4.validate()
	}
}

/// Parses a TOML configuration file into a layer.
pub fn load_config_file(path: &Path) -> Result<TrailConfigLayer, ConfigError> {
	let contents = std::fs::read_to_string(path)?;
	let layer = toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
		path: path.to_path_buf(),
		source,
	})?;
	debug!(path = %path.display(), "loaded analytics config file");
	Ok(layer)
}

/// Builds a layer from `TRAIL_ANALYTICS_*` variables found through `lookup`.
pub fn env_layer<F>(lookup: F) -> Result<TrailConfigLayer, ConfigError>
where
	F: Fn(&str) -> Option<String>,
{
	let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

	let mut layer = TrailConfigLayer::default();
	layer.analytics.enabled = parse_env(&var, "ENABLED")?;
	layer.analytics.endpoint = var("ENDPOINT");
	layer.analytics.buffer_size = parse_env(&var, "BUFFER_SIZE")?;
	layer.analytics.flush_interval_secs = parse_env(&var, "FLUSH_INTERVAL_SECS")?;
	layer.analytics.max_retries = parse_env(&var, "MAX_RETRIES")?;
	layer.analytics.respect_do_not_track = parse_env(&var, "RESPECT_DO_NOT_TRACK")?;
	layer.ga4.measurement_id = var("GA4_MEASUREMENT_ID");
	layer.ga4.api_secret = var("GA4_API_SECRET");
	if layer.ga4.measurement_id.is_some() {
		layer.ga4.enabled = Some(true);
	}
	Ok(layer)
}

fn parse_env<T, V>(var: &V, name: &str) -> Result<Option<T>, ConfigError>
where
	T: std::str::FromStr,
	T::Err: std::fmt::Display,
	V: Fn(&str) -> Option<String>,
{
	match var(name) {
		None => Ok(None),
		Some(raw) => raw
			.trim()
			.parse()
			.map(Some)
			.map_err(|e| ConfigError::Env(format!("{ENV_PREFIX}{name}={raw}: {e}"))),
	}
}

/// Loads defaults, then `path` (if given), then the process environment.
pub fn load_config(path: Option<&Path>) -> Result<TrailConfig, ConfigError> {
	let mut layer = TrailConfigLayer::default();
	if let Some(path) = path {
		layer.merge(load_config_file(path)?);
	}
	layer.merge(env_layer(|key| std::env::var(key).ok())?);

	let config = layer.finalize();
	config.validate()?;
	Ok(config)
}
