// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Properties attached to custom events and GA4 parameters.

use serde_json::{Map, Value};
use trail_analytics_core::validate_properties_size;

use crate::error::Result;

/// Parameters for a custom event or a GA4 hit, kept as a JSON object.
///
/// # Example
///
/// ```
/// use trail_analytics::Properties;
///
/// let props = Properties::new()
///     .insert("paper_id", "icml-2024")
///     .insert("format", "pdf")
///     .insert("page_count", 12);
/// assert_eq!(props.len(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
	inner: Map<String, Value>,
}

impl Properties {
	pub fn new() -> Self {
		Self { inner: Map::new() }
	}

	pub fn insert<K, V>(mut self, key: K, value: V) -> Self
	where
		K: Into<String>,
		V: Into<Value>,
	{
		self.inner.insert(key.into(), value.into());
		self
	}

	/// Inserts `value` only when it is present.
	pub fn insert_opt<K, V>(self, key: K, value: Option<V>) -> Self
	where
		K: Into<String>,
		V: Into<Value>,
	{
		match value {
			Some(value) => self.insert(key, value),
			None => self,
		}
	}

	/// Folds `other` in; its keys overwrite ours.
	pub fn merge(mut self, other: Properties) -> Self {
		self.inner.extend(other.inner);
		self
	}

	pub fn is_empty(&self) -> bool {
		self.inner.is_empty()
	}

	pub fn len(&self) -> usize {
		self.inner.len()
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.inner.get(key)
	}

	/// Fails when the serialized properties exceed the custom event size cap.
	pub fn validate(&self) -> Result<()> {
		validate_properties_size(&Value::Object(self.inner.clone()))?;
		Ok(())
	}

	pub fn into_value(self) -> Value {
		Value::Object(self.inner)
	}
}

impl From<Properties> for Value {
	fn from(props: Properties) -> Self {
		props.into_value()
	}
}

/// Non-object payloads carry no parameters.
impl From<Value> for Properties {
	fn from(value: Value) -> Self {
		match value {
			Value::Object(inner) => Self { inner },
			_ => Self::new(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::AnalyticsError;
	use proptest::prelude::*;
	use serde_json::json;

	#[test]
	fn download_params_serialize_as_flat_object() {
		let params = Properties::new()
			.insert("paper_id", "icml-2024")
			.insert("page_count", 12)
			.insert("open_access", true)
			.insert_opt::<_, String>("doi", None);

		assert_eq!(
			params.into_value(),
			json!({"paper_id": "icml-2024", "page_count": 12, "open_access": true})
		);
	}

	#[test]
	fn caller_context_overrides_common_ga4_params() {
		let common = Properties::new()
			.insert("page_location", "https://example.org/")
			.insert("engagement_time_msec", 100);
		let context = Properties::new().insert("engagement_time_msec", 2_500);

		let hit = common.merge(context);
		assert_eq!(hit.len(), 2);
		assert_eq!(hit.get("engagement_time_msec"), Some(&json!(2_500)));
		assert_eq!(hit.get("page_location"), Some(&json!("https://example.org/")));
	}

	#[test]
	fn custom_event_payload_becomes_params() {
		let params = Properties::from(json!({"section": "publications", "depth": 3}));
		assert_eq!(params.get("section"), Some(&json!("publications")));
		assert!(Properties::from(json!(["publications"])).is_empty());
		assert!(Properties::from(Value::Null).is_empty());
	}

	#[test]
	fn validation_enforces_custom_event_size_cap() {
		let abstract_text = "lorem ipsum ".repeat(6_000);
		let oversized = Properties::new().insert("abstract", abstract_text);
		assert!(matches!(oversized.validate(), Err(AnalyticsError::ValidationFailed(_))));

		let fine = Properties::new().insert("section", "awards").insert("dwell_ms", 4_200);
		assert!(fine.validate().is_ok());
	}

	proptest! {
		#[test]
		fn merge_keeps_every_section_once(
			left in prop::collection::hash_set("[a-z]{1,8}", 0..12),
			right in prop::collection::hash_set("[a-z]{1,8}", 0..12),
		) {
			let build = |keys: &std::collections::HashSet<String>| {
				keys.iter().fold(Properties::new(), |p, k| p.insert(k.clone(), 1))
			};
			let merged = build(&left).merge(build(&right));
			prop_assert_eq!(merged.len(), left.union(&right).count());
		}
	}
}
