use serde::Serialize;
use serde_json::{Map, Value};

use crate::EventTime;
use crate::coerce;
use crate::topic::{TopicError, TopicPath};

/// Payload field carrying the device's serial number.
pub const SERIAL_NUMBER_FIELD: &str = "serial_number";
/// Payload field carrying the device-side timestamp in epoch milliseconds.
pub const TIMESTAMP_FIELD: &str = "ts";

/// Why a raw message could not be turned into an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid topic: {0}")]
    Topic(#[from] TopicError),
}

/// A broker message decoded into topic metadata plus an optional JSON object.
///
/// Decoding never fails because of the body: an empty, non-UTF-8, non-JSON
/// or non-object body simply leaves `payload` empty so the topic can still
/// be attributed to a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestEvent {
    pub prefix: String,
    pub customer: String,
    pub location: String,
    pub machine: String,
    pub subtype: String,
    pub serial_number: Option<String>,
    pub timestamp_ms: Option<i64>,
    pub qos: Option<u8>,
    pub retained: Option<bool>,
    pub payload: Option<Map<String, Value>>,
}

/// Decodes a raw topic and body into an [`IngestEvent`].
pub fn decode(
    topic: &str,
    body: &[u8],
    qos: Option<u8>,
    retained: Option<bool>,
) -> Result<IngestEvent, DecodeError> {
    let TopicPath {
        prefix,
        customer,
        location,
        machine,
        subtype,
    } = TopicPath::parse(topic)?;

    let payload = parse_payload(body);
    let serial_number = payload
        .as_ref()
        .and_then(|p| p.get(SERIAL_NUMBER_FIELD))
        .and_then(coerce::text);
    let timestamp_ms = payload
        .as_ref()
        .and_then(|p| p.get(TIMESTAMP_FIELD))
        .and_then(coerce::integer);

    Ok(IngestEvent {
        prefix,
        customer,
        location,
        machine,
        subtype,
        serial_number,
        timestamp_ms,
        qos,
        retained,
        payload,
    })
}

fn parse_payload(body: &[u8]) -> Option<Map<String, Value>> {
    if body.is_empty() {
        return None;
    }

    let text = String::from_utf8_lossy(body);
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

impl IngestEvent {
    /// Full topic as reconstructed from the decoded segments.
    pub fn topic(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.prefix, self.customer, self.location, self.machine, self.subtype
        )
    }

    /// Serial number with surrounding whitespace removed, if non-empty.
    pub fn serial(&self) -> Option<&str> {
        self.serial_number
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn is_subtype(&self, subtype: &str) -> bool {
        self.subtype == subtype
    }

    /// Top-level payload field, if the payload parsed.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.as_ref()?.get(name)
    }

    /// Top-level payload field that is itself a JSON object.
    pub fn object_field(&self, name: &str) -> Option<&Map<String, Value>> {
        self.field(name)?.as_object()
    }

    /// The device-reported time, when present and representable.
    pub fn reported_time(&self) -> Option<EventTime> {
        self.timestamp_ms.and_then(EventTime::from_millis)
    }

    /// The reported time, or the current time when the device sent none.
    ///
    /// Evaluated at the point of use, so two stores handling the same
    /// timestamp-less event may record slightly different instants.
    pub fn time_or_now(&self) -> EventTime {
        self.reported_time().unwrap_or_else(EventTime::now)
    }
}
