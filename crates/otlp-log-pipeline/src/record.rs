// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Owned log record model used by every pipeline stage.
//!
//! Decoded OTLP messages are converted into these types once at the front-end boundary;
//! the stages never see protobuf types.

use std::fmt;

use opentelemetry_proto::tonic::{
    common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue as ProtoKeyValue},
    logs::v1::LogRecord as ProtoLogRecord,
    resource::v1::Resource as ProtoResource,
};

/// OpenTelemetry severity number (0 = unspecified, 1..=24 across six tiers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Severity(i32);

impl Severity {
    pub const UNSPECIFIED: Severity = Severity(0);
    pub const TRACE: Severity = Severity(1);
    pub const DEBUG: Severity = Severity(5);
    pub const INFO: Severity = Severity(9);
    pub const WARN: Severity = Severity(13);
    pub const ERROR: Severity = Severity(17);
    pub const FATAL: Severity = Severity(21);

    pub const fn from_number(number: i32) -> Self {
        Severity(number)
    }

    pub const fn number(self) -> i32 {
        self.0
    }

    /// Tier names, indexed by [`Severity::tier`].
    pub const TIER_NAMES: [&'static str; 7] =
        ["UNSPECIFIED", "TRACE", "DEBUG", "INFO", "WARN", "ERROR", "FATAL"];

    /// Tier this severity number falls into: 0 for unspecified or out of range, then one
    /// tier per four numbers.
    pub const fn tier(self) -> usize {
        match self.0 {
            1..=24 => ((self.0 - 1) / 4 + 1) as usize,
            _ => 0,
        }
    }

    /// Name of the tier this severity number falls into.
    pub fn name(self) -> &'static str {
        Self::TIER_NAMES[self.tier()]
    }
}

/// Typed attribute or body value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AttributeValue {
    #[default]
    Empty,
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Array(Vec<AttributeValue>),
    KvList(Vec<KeyValue>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Empty => Ok(()),
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::Int(i) => write!(f, "{i}"),
            AttributeValue::Double(d) => write!(f, "{d:.6}"),
            AttributeValue::Bool(b) => write!(f, "{b}"),
            AttributeValue::Bytes(b) => write!(f, "[{} bytes]", b.len()),
            AttributeValue::Array(values) => write!(f, "[array: {} items]", values.len()),
            AttributeValue::KvList(values) => write!(f, "[kvlist: {} items]", values.len()),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: AttributeValue,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Attributes shared by every record of one resource group.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Resource {
    pub attributes: Vec<KeyValue>,
}

/// Instrumentation scope that emitted a group of records.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Scope {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogRecord {
    pub time_unix_nano: u64,
    pub observed_time_unix_nano: u64,
    pub severity: Severity,
    pub severity_text: String,
    pub body: Option<AttributeValue>,
    /// Keys are not guaranteed unique. Order is not meaningful once a delete has run.
    pub attributes: Vec<KeyValue>,
}

impl LogRecord {
    /// First attribute with the given key.
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| &kv.value)
    }

    /// First attribute with the given key, if it holds a string.
    pub fn string_attribute(&self, key: &str) -> Option<&str> {
        self.attribute(key).and_then(AttributeValue::as_str)
    }

    /// Overwrites the first attribute with `key`, or appends a new one.
    pub fn set_attribute(&mut self, key: &str, value: impl Into<AttributeValue>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|kv| kv.key == key) {
            Some(kv) => kv.value = value,
            None => self.attributes.push(KeyValue {
                key: key.to_string(),
                value,
            }),
        }
    }

    /// Body rendered as text; a missing body renders empty.
    pub fn body_text(&self) -> String {
        self.body
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    /// Sender-provided severity text, or the tier name when the sender left it blank.
    pub fn severity_display(&self) -> &str {
        if self.severity_text.is_empty() {
            self.severity.name()
        } else {
            &self.severity_text
        }
    }
}

impl From<AnyValue> for AttributeValue {
    fn from(value: AnyValue) -> Self {
        match value.value {
            None => AttributeValue::Empty,
            Some(any_value::Value::StringValue(s)) => AttributeValue::String(s),
            Some(any_value::Value::IntValue(i)) => AttributeValue::Int(i),
            Some(any_value::Value::DoubleValue(d)) => AttributeValue::Double(d),
            Some(any_value::Value::BoolValue(b)) => AttributeValue::Bool(b),
            Some(any_value::Value::BytesValue(b)) => AttributeValue::Bytes(b),
            Some(any_value::Value::ArrayValue(array)) => {
                AttributeValue::Array(array.values.into_iter().map(Into::into).collect())
            }
            Some(any_value::Value::KvlistValue(list)) => {
                AttributeValue::KvList(list.values.into_iter().map(Into::into).collect())
            }
        }
    }
}

impl From<ProtoKeyValue> for KeyValue {
    fn from(kv: ProtoKeyValue) -> Self {
        KeyValue {
            key: kv.key,
            value: kv.value.map(Into::into).unwrap_or_default(),
        }
    }
}

impl From<ProtoResource> for Resource {
    fn from(resource: ProtoResource) -> Self {
        Resource {
            attributes: resource.attributes.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<InstrumentationScope> for Scope {
    fn from(scope: InstrumentationScope) -> Self {
        Scope {
            name: scope.name,
            version: scope.version,
        }
    }
}

impl From<ProtoLogRecord> for LogRecord {
    fn from(record: ProtoLogRecord) -> Self {
        LogRecord {
            time_unix_nano: record.time_unix_nano,
            observed_time_unix_nano: record.observed_time_unix_nano,
            severity: Severity::from_number(record.severity_number),
            severity_text: record.severity_text,
            body: record.body.map(Into::into),
            attributes: record.attributes.into_iter().map(Into::into).collect(),
        }
    }
}
