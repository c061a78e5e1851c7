//! Message headers, per-send properties and payload codecs.
use amq_protocol_types::{
    generation::gen_field_table, parsing::parse_field_table, AMQPValue, ByteArray, FieldArray,
    FieldTable, LongString, ShortString,
};
use cookie_factory::gen_simple;
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;

/// Message headers. Keys are case-sensitive.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A header (or map message entry) value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<HeaderValue>),
    Map(Headers),
    Bytes(Vec<u8>),
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for HeaderValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// Typed extraction of a [`HeaderValue`], used by `get_header`.
///
/// Integers convert between widths when the value fits; strings are not parsed.
pub trait FromHeaderValue: Sized {
    fn from_header_value(value: &HeaderValue) -> Option<Self>;
}

impl FromHeaderValue for HeaderValue {
    fn from_header_value(value: &HeaderValue) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromHeaderValue for bool {
    fn from_header_value(value: &HeaderValue) -> Option<Self> {
        match value {
            HeaderValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromHeaderValue for i64 {
    fn from_header_value(value: &HeaderValue) -> Option<Self> {
        match value {
            HeaderValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl FromHeaderValue for i32 {
    fn from_header_value(value: &HeaderValue) -> Option<Self> {
        i64::from_header_value(value).and_then(|i| i32::try_from(i).ok())
    }
}

impl FromHeaderValue for u32 {
    fn from_header_value(value: &HeaderValue) -> Option<Self> {
        i64::from_header_value(value).and_then(|i| u32::try_from(i).ok())
    }
}

impl FromHeaderValue for u64 {
    fn from_header_value(value: &HeaderValue) -> Option<Self> {
        i64::from_header_value(value).and_then(|i| u64::try_from(i).ok())
    }
}

impl FromHeaderValue for f64 {
    fn from_header_value(value: &HeaderValue) -> Option<Self> {
        match value {
            HeaderValue::Float(f) => Some(*f),
            HeaderValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl FromHeaderValue for String {
    fn from_header_value(value: &HeaderValue) -> Option<Self> {
        match value {
            HeaderValue::String(s) => Some(s.clone()),
            HeaderValue::Bytes(b) => String::from_utf8(b.clone()).ok(),
            _ => None,
        }
    }
}

impl FromHeaderValue for Vec<u8> {
    fn from_header_value(value: &HeaderValue) -> Option<Self> {
        match value {
            HeaderValue::Bytes(b) => Some(b.clone()),
            HeaderValue::String(s) => Some(s.as_bytes().to_vec()),
            _ => None,
        }
    }
}

impl From<&HeaderValue> for AMQPValue {
    fn from(value: &HeaderValue) -> Self {
        match value {
            HeaderValue::Null => AMQPValue::Void,
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
            HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
            HeaderValue::Float(f) => AMQPValue::Double(*f),
            HeaderValue::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
            HeaderValue::List(values) => AMQPValue::FieldArray(FieldArray::from(
                values.iter().map(AMQPValue::from).collect::<Vec<_>>(),
            )),
            HeaderValue::Map(map) => AMQPValue::FieldTable(to_field_table(map)),
            HeaderValue::Bytes(b) => AMQPValue::ByteArray(ByteArray::from(b.clone())),
        }
    }
}

impl From<&AMQPValue> for HeaderValue {
    fn from(value: &AMQPValue) -> Self {
        #[allow(unreachable_patterns)]
        match value {
            AMQPValue::Boolean(b) => Self::Bool(*b),
            AMQPValue::ShortShortInt(i) => Self::Int((*i).into()),
            AMQPValue::ShortShortUInt(i) => Self::Int((*i).into()),
            AMQPValue::ShortInt(i) => Self::Int((*i).into()),
            AMQPValue::ShortUInt(i) => Self::Int((*i).into()),
            AMQPValue::LongInt(i) => Self::Int((*i).into()),
            AMQPValue::LongUInt(i) => Self::Int((*i).into()),
            AMQPValue::LongLongInt(i) => Self::Int(*i),
            AMQPValue::Float(f) => Self::Float((*f).into()),
            AMQPValue::Double(f) => Self::Float(*f),
            AMQPValue::DecimalValue(d) => {
                Self::Float(f64::from(d.value) / 10f64.powi(i32::from(d.scale)))
            }
            AMQPValue::ShortString(s) => Self::String(s.as_str().to_owned()),
            AMQPValue::LongString(s) => {
                Self::String(String::from_utf8_lossy(s.as_bytes()).into_owned())
            }
            AMQPValue::FieldArray(values) => {
                Self::List(values.as_slice().iter().map(HeaderValue::from).collect())
            }
            AMQPValue::Timestamp(t) => Self::Int(i64::try_from(*t).unwrap_or(i64::MAX)),
            AMQPValue::FieldTable(table) => Self::Map(from_field_table(table)),
            AMQPValue::ByteArray(b) => Self::Bytes(b.as_slice().to_vec()),
            AMQPValue::Void => Self::Null,
            _ => Self::Null,
        }
    }
}

/// Convert headers into an AMQP field table.
pub fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.as_str()), AMQPValue::from(value));
    }
    table
}

/// Convert an AMQP field table into headers.
pub fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_owned(), HeaderValue::from(value)))
        .collect()
}

/// Properties applied to one outgoing message.
///
/// Senders hand a mutable instance to the caller-supplied callback of `send_with`; fields left
/// as `None` fall back to the destination's settings or to generated values (message id,
/// timestamp).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendProperties {
    /// Overrides the routing key of a publisher. Producers ignore it.
    pub routing_key: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    /// The message expires if it is not consumed within this window.
    pub time_to_live: Option<Duration>,
    pub priority: Option<u8>,
    /// Overrides the persistence configured on the destination.
    pub persistent: Option<bool>,
    /// Seconds since the UNIX epoch.
    pub timestamp: Option<u64>,
    pub headers: Headers,
}

impl SendProperties {
    /// Set a header, replacing any previous value under the same key.
    pub fn set_header(
        &mut self,
        key: impl Into<String>,
        value: impl Into<HeaderValue>,
    ) -> &mut Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub(crate) fn is_persistent(&self) -> bool {
        self.persistent.unwrap_or(true)
    }
}

/// A message the broker could not route and handed back to the publisher.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnedMessage {
    /// AMQP reply code, e.g. 312 (`NO_ROUTE`).
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub headers: Headers,
    pub data: Vec<u8>,
}

/// How a payload travels over the wire.
///
/// Every sender and receiver is parametrised by a payload type: [`Text`], [`Bytes`] or [`Map`].
pub trait Payload: Send + Sync + 'static {
    /// What senders accept.
    type Borrowed: ?Sized + Sync;
    /// What receivers hand back.
    type Owned: Send + Sync + 'static;

    /// Content type stamped on outgoing messages unless overridden.
    const CONTENT_TYPE: &'static str;

    fn encode(data: &Self::Borrowed) -> Result<Cow<'_, [u8]>, anyhow::Error>;

    fn decode(bytes: Vec<u8>) -> Result<Self::Owned, anyhow::Error>;
}

/// UTF-8 text payloads.
#[derive(Debug, Clone, Copy)]
pub struct Text;

/// Opaque binary payloads.
#[derive(Debug, Clone, Copy)]
pub struct Bytes;

/// Map messages: a [`Headers`]-shaped body encoded as an AMQP field table.
#[derive(Debug, Clone, Copy)]
pub struct Map;

impl Payload for Text {
    type Borrowed = str;
    type Owned = String;

    const CONTENT_TYPE: &'static str = "text/plain";

    fn encode(data: &str) -> Result<Cow<'_, [u8]>, anyhow::Error> {
        Ok(Cow::Borrowed(data.as_bytes()))
    }

    fn decode(bytes: Vec<u8>) -> Result<String, anyhow::Error> {
        Ok(String::from_utf8(bytes)?)
    }
}

impl Payload for Bytes {
    type Borrowed = [u8];
    type Owned = Vec<u8>;

    const CONTENT_TYPE: &'static str = "application/octet-stream";

    fn encode(data: &[u8]) -> Result<Cow<'_, [u8]>, anyhow::Error> {
        Ok(Cow::Borrowed(data))
    }

    fn decode(bytes: Vec<u8>) -> Result<Vec<u8>, anyhow::Error> {
        Ok(bytes)
    }
}

// Bodies are AMQP field tables, the wire layout of message headers.
impl Payload for Map {
    type Borrowed = Headers;
    type Owned = Headers;

    const CONTENT_TYPE: &'static str = "application/x-amqp-table";

    fn encode(data: &Headers) -> Result<Cow<'_, [u8]>, anyhow::Error> {
        let table = to_field_table(data);
        let bytes = gen_simple(gen_field_table(&table), Vec::new())?;
        Ok(Cow::Owned(bytes))
    }

    fn decode(bytes: Vec<u8>) -> Result<Headers, anyhow::Error> {
        let (_, table) = parse_field_table(bytes.as_slice())
            .map_err(|e| anyhow::anyhow!("Failed to parse a map message body: {e:?}"))?;
        Ok(from_field_table(&table))
    }
}
