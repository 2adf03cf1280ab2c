// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Metric points and their schemas.
//!
//! Points travel on the bus as structured payloads:
//!
//! ```text
//! {"measurement": "delta_to", "tags": {"host": "rig-01", ...}, "fields": {"value": 0.013}, "time": 1700000000.25}
//! ```
//!
//! and can be rendered as InfluxDB line protocol for external sinks:
//!
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp_ns
//! ```

use crate::MetricError;
use sensorfleet::{BrokerClient, Payload};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Field value of a metric point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    String(String),
}

impl FieldValue {
    /// Format for line protocol: floats as-is, integers with an `i`
    /// suffix, strings quoted with inner quotes escaped.
    pub fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Float(v) => format!("{}", v),
            FieldValue::Integer(v) => format!("{}i", v),
            FieldValue::String(v) => {
                let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{}\"", escaped)
            }
        }
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Integer(_) => FieldType::Integer,
            FieldValue::Float(_) => FieldType::Float,
            FieldValue::String(_) => FieldType::String,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            FieldValue::String(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line_protocol())
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Integer,
    Float,
    String,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::String => "string",
        };
        f.write_str(name)
    }
}

/// One metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub measurement: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Unix seconds.
    pub time: f64,
}

impl MetricPoint {
    /// Empty point stamped with the current time.
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            time: sensorfleet::unix_now(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Override the timestamp (Unix seconds).
    pub fn at(mut self, time: f64) -> Self {
        self.time = time;
        self
    }

    /// Timestamp in nanoseconds since the Unix epoch.
    pub fn timestamp_ns(&self) -> u64 {
        if self.time <= 0.0 {
            return 0;
        }
        (self.time * 1e9) as u64
    }

    /// Render as one line-protocol line. Tags and fields come out sorted by
    /// key.
    pub fn to_line_protocol(&self) -> Result<String, MetricError> {
        if self.fields.is_empty() {
            return Err(MetricError::NoFields(self.measurement.clone()));
        }

        let mut line = escape_measurement(&self.measurement);

        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&escape_key(value));
        }

        line.push(' ');

        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&value.to_line_protocol());
        }

        line.push(' ');
        line.push_str(&self.timestamp_ns().to_string());

        Ok(line)
    }

    /// Publish as a structured payload.
    pub fn publish(&self, client: &dyn BrokerClient, topic: &str) -> Result<(), MetricError> {
        client.publish(topic, Payload::structured(self)?, false)?;
        Ok(())
    }
}

/// Spaces and commas are escaped in measurement names.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Commas, equals signs and spaces are escaped in tag keys, tag values and
/// field keys.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// Declared shape of a measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSchema {
    measurement: String,
    fields: BTreeMap<String, FieldType>,
    required_tags: Vec<String>,
}

impl MetricSchema {
    /// Schema requiring the `host` tag.
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            fields: BTreeMap::new(),
            required_tags: vec!["host".to_string()],
        }
    }

    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(name.into(), field_type);
        self
    }

    pub fn require_tag(mut self, tag: impl Into<String>) -> Self {
        self.required_tags.push(tag.into());
        self
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Check a point, widening integer values declared as float.
    pub fn validate(&self, mut point: MetricPoint) -> Result<MetricPoint, MetricError> {
        if point.measurement != self.measurement {
            return Err(MetricError::MeasurementMismatch {
                expected: self.measurement.clone(),
                found: point.measurement,
            });
        }

        for tag in &self.required_tags {
            if !point.tags.contains_key(tag) {
                return Err(MetricError::MissingTag {
                    measurement: self.measurement.clone(),
                    tag: tag.clone(),
                });
            }
        }

        for (name, declared) in &self.fields {
            let Some(value) = point.fields.get_mut(name) else {
                return Err(MetricError::MissingField {
                    measurement: self.measurement.clone(),
                    field: name.clone(),
                });
            };

            let widened = match (declared, &*value) {
                (FieldType::Float, FieldValue::Integer(v)) => Some(FieldValue::Float(*v as f64)),
                (declared, actual) if *declared == actual.field_type() => None,
                (declared, actual) => {
                    return Err(MetricError::TypeMismatch {
                        measurement: self.measurement.clone(),
                        field: name.clone(),
                        expected: *declared,
                        found: actual.field_type(),
                    })
                }
            };
            if let Some(widened) = widened {
                *value = widened;
            }
        }

        if let Some(extra) = point.fields.keys().find(|k| !self.fields.contains_key(*k)) {
            return Err(MetricError::UnknownField {
                measurement: self.measurement.clone(),
                field: extra.clone(),
            });
        }

        Ok(point)
    }
}

/// Measurement of one stage's own processing time.
pub const DELTA_PROCESSING: &str = "delta_processing";
/// Measurement of the hand-off time between two stages.
pub const DELTA_TO: &str = "delta_to";
/// Measurement of per-second event counts.
pub const PER_SECOND: &str = "per_second";

/// Schema of a built-in measurement.
pub fn builtin_schema(measurement: &str) -> Option<MetricSchema> {
    match measurement {
        DELTA_PROCESSING => Some(
            MetricSchema::new(DELTA_PROCESSING)
                .field("value", FieldType::Float)
                .require_tag("device")
                .require_tag("stage"),
        ),
        DELTA_TO => Some(
            MetricSchema::new(DELTA_TO)
                .field("value", FieldType::Float)
                .require_tag("device")
                .require_tag("receiver")
                .require_tag("sender"),
        ),
        PER_SECOND => Some(
            MetricSchema::new(PER_SECOND)
                .field("count", FieldType::Integer)
                .field("rate", FieldType::Float)
                .require_tag("source"),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_value_formats() {
        assert_eq!(FieldValue::Float(3.15).to_line_protocol(), "3.15");
        assert_eq!(FieldValue::Integer(42).to_line_protocol(), "42i");
        assert_eq!(
            FieldValue::String("say \"hi\"".into()).to_line_protocol(),
            "\"say \\\"hi\\\"\""
        );
    }

    #[test]
    fn test_line_protocol_sorted_tags() {
        let point = MetricPoint::new("delta_processing")
            .tag("stage", "Inference")
            .tag("host", "rig-01")
            .field("value", 0.25)
            .at(1.0);

        assert_eq!(
            point.to_line_protocol().expect("line"),
            "delta_processing,host=rig-01,stage=Inference value=0.25 1000000000"
        );
    }

    #[test]
    fn test_line_protocol_escapes() {
        let point = MetricPoint::new("my measurement")
            .tag("tag key", "tag,value")
            .field("field=key", "hello \"world\"")
            .at(3.0);

        assert_eq!(
            point.to_line_protocol().expect("line"),
            "my\\ measurement,tag\\ key=tag\\,value field\\=key=\"hello \\\"world\\\"\" 3000000000"
        );
    }

    #[test]
    fn test_line_protocol_requires_fields() {
        let point = MetricPoint::new("empty");
        assert!(matches!(point.to_line_protocol(), Err(MetricError::NoFields(_))));
    }

    #[test]
    fn test_schema_widens_integer_to_float() {
        let schema = builtin_schema(DELTA_TO).expect("schema");
        let point = MetricPoint::new(DELTA_TO)
            .tag("host", "h")
            .tag("device", "cam1")
            .tag("receiver", "Inference")
            .tag("sender", "Camera")
            .field("value", 1i64);

        let point = schema.validate(point).expect("valid");
        assert_eq!(point.fields["value"], FieldValue::Float(1.0));
    }

    #[test]
    fn test_schema_rejects_bad_points() {
        let schema = builtin_schema(PER_SECOND).expect("schema");

        let missing_host = MetricPoint::new(PER_SECOND)
            .tag("source", "cam1")
            .field("count", 1i64)
            .field("rate", 1.0);
        assert!(matches!(
            schema.validate(missing_host),
            Err(MetricError::MissingTag { .. })
        ));

        let float_count = MetricPoint::new(PER_SECOND)
            .tag("host", "h")
            .tag("source", "cam1")
            .field("count", 1.5)
            .field("rate", 1.0);
        assert!(matches!(
            schema.validate(float_count),
            Err(MetricError::TypeMismatch { .. })
        ));

        let extra = MetricPoint::new(PER_SECOND)
            .tag("host", "h")
            .tag("source", "cam1")
            .field("count", 1i64)
            .field("rate", 1.0)
            .field("bogus", "x");
        assert!(matches!(
            schema.validate(extra),
            Err(MetricError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_json_payload_shape() {
        let point = MetricPoint::new(PER_SECOND)
            .tag("host", "h")
            .field("count", 3i64)
            .field("rate", 1.5)
            .at(10.0);

        let json = serde_json::to_value(&point).expect("json");
        assert_eq!(json["fields"]["count"], 3);
        assert_eq!(json["fields"]["rate"], 1.5);

        let back: MetricPoint = serde_json::from_value(json).expect("decode");
        assert_eq!(back, point);
    }
}
