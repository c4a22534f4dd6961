//! Small serde helpers shared across config structs.
//!
//! Durations in the config surface (§6) are always plain millisecond
//! integers on the wire; `serde_millis` (de)serializes them as `Duration`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub fn is_default<T: Default + PartialEq>(t: &T) -> bool {
	*t == Default::default()
}

pub mod serde_millis {
	use super::*;

	pub fn serialize<S: Serializer>(t: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(t.as_millis() as u64)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		let ms = u64::deserialize(deserializer)?;
		Ok(Duration::from_millis(ms))
	}
}

pub mod serde_millis_option {
	use super::*;

	pub fn serialize<S: Serializer>(
		t: &Option<Duration>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match t {
			None => serializer.serialize_none(),
			Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(
		deserializer: D,
	) -> Result<Option<Duration>, D::Error> {
		let ms = Option::<u64>::deserialize(deserializer)?;
		Ok(ms.map(Duration::from_millis))
	}
}

/// We don't want YAML's loose typing (e.g. bare numbers for durations)
/// but we do want both YAML and JSON as input formats. Transcode via JSON's
/// serde_json::Value so struct-level `deny_unknown_fields` still applies.
pub mod format {
	use anyhow::Context;
	use serde::de::DeserializeOwned;

	pub fn from_str<T: DeserializeOwned>(s: &str) -> anyhow::Result<T> {
		let looks_like_json = s.trim_start().starts_with(['{', '[']);
		if looks_like_json {
			serde_json::from_str(s).context("invalid JSON config")
		} else {
			let value: serde_yaml::Value = serde_yaml::from_str(s).context("invalid YAML config")?;
			serde_yaml::from_value(value).context("config does not match schema")
		}
	}
}
