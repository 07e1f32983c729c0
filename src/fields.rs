//! Timezone-aware formatting of date-time attributes.
//!
//! The remote schema flags date fields with `format: "date-time"`. When the
//! layer names an output timezone, those values are rewritten as
//! `YYYY-MM-DD HH:mm <zone>`. Feature servers encode dates as epoch
//! milliseconds; RFC 3339 strings are accepted as well.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Value};

use crate::{Result, SyncError};

const OUTPUT_FORMAT: &str = "%Y-%m-%d %H:%M %Z";

/// Parse an IANA timezone name such as `America/Denver`.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| SyncError::Config(format!("unknown timezone: {name}")))
}

/// Names of properties the schema marks as date-time.
pub fn date_time_fields(schema: &Value) -> BTreeSet<String> {
    schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| {
            props
                .iter()
                .filter(|(_, def)| def.get("format").and_then(Value::as_str) == Some("date-time"))
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Rewrites date-time properties into the configured zone.
#[derive(Debug, Clone)]
pub struct DateFormatter {
    tz: Tz,
    fields: BTreeSet<String>,
}

impl DateFormatter {
    pub fn new(tz: Tz, fields: BTreeSet<String>) -> Self {
        Self { tz, fields }
    }

    /// Build from a timezone name and the remote property schema.
    pub fn from_schema(timezone: &str, schema: &Value) -> Result<Self> {
        Ok(Self::new(parse_timezone(timezone)?, date_time_fields(schema)))
    }

    pub fn fields(&self) -> &BTreeSet<String> {
        &self.fields
    }

    /// Reformat every known date-time field in place. Values that cannot be
    /// read as a timestamp are left as they are.
    pub fn apply(&self, properties: &mut Map<String, Value>) {
        for field in &self.fields {
            let Some(value) = properties.get_mut(field) else {
                continue;
            };
            if let Some(instant) = read_instant(value) {
                *value = Value::String(self.format(instant));
            }
        }
    }

    fn format(&self, instant: DateTime<Utc>) -> String {
        instant
            .with_timezone(&self.tz)
            .format(OUTPUT_FORMAT)
            .to_string()
    }
}

fn read_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}
