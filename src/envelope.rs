//! Telemetry items and the envelope they are serialized into

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::Result;

/// Context tag keys written by enrichment
pub mod tag_keys {
    pub const USER_ID: &str = "ai.user.id";
    pub const SESSION_ID: &str = "ai.session.id";
    pub const OPERATION_ID: &str = "ai.operation.id";
    pub const OPERATION_NAME: &str = "ai.operation.name";
    pub const DEVICE_ID: &str = "ai.device.id";
    pub const SDK_VERSION: &str = "ai.internal.sdkVersion";
}

const MAX_NAME_LENGTH: usize = 1024;
const MAX_TAG_VALUE_LENGTH: usize = 1024;

/// Severity of a trace message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SeverityLevel {
    Verbose,
    #[default]
    Information,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    pub message: String,
    pub severity_level: SeverityLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionData {
    pub type_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub severity_level: SeverityLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricData {
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageViewData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDependencyData {
    pub name: String,
    pub target: String,
    pub duration_ms: f64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_code: Option<String>,
    /// `Ajax` or `Fetch`
    pub dependency_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    pub name: String,
    pub url: String,
    pub duration_ms: f64,
    pub response_code: String,
    pub success: bool,
}

/// Every kind of telemetry the channel accepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TelemetryKind {
    Event(EventData),
    Trace(MessageData),
    Exception(ExceptionData),
    Metric(MetricData),
    PageView(PageViewData),
    RemoteDependency(RemoteDependencyData),
    Request(RequestData),
}

impl TelemetryKind {
    /// Short type name used in the envelope name
    pub fn type_name(&self) -> &'static str {
        match self {
            TelemetryKind::Event(_) => "Event",
            TelemetryKind::Trace(_) => "Message",
            TelemetryKind::Exception(_) => "Exception",
            TelemetryKind::Metric(_) => "Metric",
            TelemetryKind::PageView(_) => "Pageview",
            TelemetryKind::RemoteDependency(_) => "RemoteDependency",
            TelemetryKind::Request(_) => "Request",
        }
    }

    pub fn base_type(&self) -> &'static str {
        match self {
            TelemetryKind::Event(_) => "EventData",
            TelemetryKind::Trace(_) => "MessageData",
            TelemetryKind::Exception(_) => "ExceptionData",
            TelemetryKind::Metric(_) => "MetricData",
            TelemetryKind::PageView(_) => "PageviewData",
            TelemetryKind::RemoteDependency(_) => "RemoteDependencyData",
            TelemetryKind::Request(_) => "RequestData",
        }
    }

    pub fn is_metric(&self) -> bool {
        matches!(self, TelemetryKind::Metric(_))
    }

    fn base_data(&self) -> Result<Value> {
        let value = match self {
            TelemetryKind::Event(d) => serde_json::to_value(d)?,
            TelemetryKind::Trace(d) => serde_json::to_value(d)?,
            TelemetryKind::Exception(d) => serde_json::to_value(d)?,
            TelemetryKind::Metric(d) => serde_json::to_value(d)?,
            TelemetryKind::PageView(d) => serde_json::to_value(d)?,
            TelemetryKind::RemoteDependency(d) => serde_json::to_value(d)?,
            TelemetryKind::Request(d) => serde_json::to_value(d)?,
        };
        Ok(value)
    }
}

/// A raw telemetry record as handed to the channel by a tracking call
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryItem {
    pub kind: TelemetryKind,
    /// Creation time; filled with the current time when absent
    pub time: Option<DateTime<Utc>>,
    /// Custom properties, serialized into `baseData.properties`
    pub properties: BTreeMap<String, String>,
    /// Context tags set by the caller; never overwritten by enrichment
    pub tags: BTreeMap<String, String>,
}

impl TelemetryItem {
    pub fn new(kind: TelemetryKind) -> Self {
        Self {
            kind,
            time: None,
            properties: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn event(name: impl Into<String>) -> Self {
        Self::new(TelemetryKind::Event(EventData {
            name: name.into(),
            measurements: BTreeMap::new(),
        }))
    }

    pub fn trace(message: impl Into<String>, severity_level: SeverityLevel) -> Self {
        Self::new(TelemetryKind::Trace(MessageData {
            message: message.into(),
            severity_level,
        }))
    }

    pub fn exception(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(TelemetryKind::Exception(ExceptionData {
            type_name: type_name.into(),
            message: message.into(),
            stack: None,
            severity_level: SeverityLevel::Error,
        }))
    }

    pub fn metric(name: impl Into<String>, value: f64) -> Self {
        Self::new(TelemetryKind::Metric(MetricData {
            name: name.into(),
            value,
            count: None,
            min: None,
            max: None,
        }))
    }

    pub fn page_view(name: impl Into<String>, uri: Option<String>) -> Self {
        Self::new(TelemetryKind::PageView(PageViewData {
            name: name.into(),
            uri,
            duration_ms: None,
        }))
    }

    /// Set the creation time
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Add a custom property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Set a context tag; enrichment will not replace it
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Wrap the item into an envelope
    pub fn into_envelope(
        self,
        instrumentation_key: Option<&str>,
        name_prefix: &str,
    ) -> Result<TelemetryEnvelope> {
        let mut base_data = self.kind.base_data()?;
        if !self.properties.is_empty() {
            if let Value::Object(map) = &mut base_data {
                map.insert(
                    "properties".to_string(),
                    serde_json::to_value(&self.properties)?,
                );
            }
        }

        let mut name_parts: Vec<String> = Vec::with_capacity(3);
        if !name_prefix.is_empty() {
            name_parts.push(name_prefix.trim_end_matches('.').to_string());
        }
        if let Some(ikey) = instrumentation_key {
            name_parts.push(ikey.replace('-', ""));
        }
        name_parts.push(self.kind.type_name().to_string());

        let time = self
            .time
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

        Ok(TelemetryEnvelope {
            name: name_parts.join("."),
            time,
            i_key: instrumentation_key.map(str::to_string),
            sample_rate: None,
            tags: self.tags,
            data: EnvelopeData {
                base_type: self.kind.base_type().to_string(),
                base_data,
            },
        })
    }
}

/// Payload part of an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeData {
    pub base_type: String,
    pub base_data: Value,
}

/// A telemetry item ready for transmission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEnvelope {
    pub name: String,
    /// UTC creation time, RFC 3339 with a trailing `Z`
    pub time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i_key: Option<String>,
    /// Percentage of items represented by this one, when sampling is active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<f64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub data: EnvelopeData,
}

impl TelemetryEnvelope {
    pub fn base_type(&self) -> &str {
        &self.data.base_type
    }

    pub fn is_metric(&self) -> bool {
        self.data.base_type == "MetricData"
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Clamp field lengths to what the endpoint accepts
    pub fn sanitize(&mut self) {
        truncate_chars(&mut self.name, MAX_NAME_LENGTH);
        for value in self.tags.values_mut() {
            truncate_chars(value, MAX_TAG_VALUE_LENGTH);
        }
    }

    /// Serialize to the wire representation. The returned string is what
    /// gets buffered and is never modified afterwards.
    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn truncate_chars(value: &mut String, max_chars: usize) {
    if let Some((idx, _)) = value.char_indices().nth(max_chars) {
        value.truncate(idx);
    }
}
