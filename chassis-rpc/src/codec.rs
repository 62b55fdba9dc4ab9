//! msgpack value codec with extension-type translation.
//!
//! Plain values map one-to-one onto msgpack. [`Object`] values are packed as
//! msgpack extensions through a [`TranslationTable`]: each entry ties an
//! extension code to a Rust type plus a packer and an unpacker. The packer
//! turns the object into a [`Value`] which is itself msgpack-encoded into the
//! extension payload.
//!
//! A process-wide default table covers the chrono temporal types:
//!
//! | code | type                          |
//! |------|-------------------------------|
//! | 127  | `chrono::NaiveDate`           |
//! | 126  | `chrono::DateTime<FixedOffset>` |
//! | 125  | `chrono::NaiveTime`           |
//! | 124  | `chrono::TimeDelta`           |
//! | 123  | `chrono::FixedOffset`         |
//!
//! Caller tables are consulted before the defaults, both when packing (first
//! matching type in ascending code order) and when unpacking (by code).

use std::any::TypeId;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeDelta};
use once_cell::sync::Lazy;
use rmpv::{Integer, Utf8String};

use crate::error::CodecError;
use crate::value::{Kwargs, Object, ObjectValue, Value};

type PackFn = Arc<dyn Fn(&Object) -> Result<Value, CodecError> + Send + Sync>;
type UnpackFn = Arc<dyn Fn(Value) -> Result<Object, CodecError> + Send + Sync>;

pub const DATE_CODE: i8 = 127;
pub const DATETIME_CODE: i8 = 126;
pub const TIME_CODE: i8 = 125;
pub const TIMEDELTA_CODE: i8 = 124;
pub const TIMEZONE_CODE: i8 = 123;

#[derive(Clone)]
struct Translation {
    type_id: TypeId,
    type_name: &'static str,
    pack: PackFn,
    unpack: UnpackFn,
}

/// Extension code → (type, packer, unpacker).
#[derive(Clone, Default)]
pub struct TranslationTable {
    entries: BTreeMap<i8, Translation>,
}

static DEFAULT_TABLE: Lazy<TranslationTable> = Lazy::new(build_default_table);

impl TranslationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default table.
    pub fn default_table() -> &'static TranslationTable {
        &DEFAULT_TABLE
    }

    /// Register `T` under `code`, replacing any entry with the same code.
    pub fn register<T, P, U>(&mut self, code: i8, pack: P, unpack: U) -> &mut Self
    where
        T: ObjectValue,
        P: Fn(&T) -> Value + Send + Sync + 'static,
        U: Fn(Value) -> Result<T, CodecError> + Send + Sync + 'static,
    {
        let type_name = std::any::type_name::<T>();
        let pack: PackFn = Arc::new(move |obj: &Object| {
            obj.downcast_ref::<T>()
                .map(&pack)
                .ok_or(CodecError::NoTranslation(type_name))
        });
        let unpack: UnpackFn = Arc::new(move |value| unpack(value).map(Object::new));
        self.entries.insert(
            code,
            Translation {
                type_id: TypeId::of::<T>(),
                type_name,
                pack,
                unpack,
            },
        );
        self
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with<T, P, U>(mut self, code: i8, pack: P, unpack: U) -> Self
    where
        T: ObjectValue,
        P: Fn(&T) -> Value + Send + Sync + 'static,
        U: Fn(Value) -> Result<T, CodecError> + Send + Sync + 'static,
    {
        self.register(code, pack, unpack);
        self
    }

    pub fn contains(&self, code: i8) -> bool {
        self.entries.contains_key(&code)
    }

    pub fn codes(&self) -> Vec<i8> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find_type(&self, type_id: TypeId) -> Option<(i8, &Translation)> {
        self.entries
            .iter()
            .find(|(_, t)| t.type_id == type_id)
            .map(|(code, t)| (*code, t))
    }

    fn get(&self, code: i8) -> Option<&Translation> {
        self.entries.get(&code)
    }
}

impl fmt::Debug for TranslationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(code, t)| (code, t.type_name)))
            .finish()
    }
}

fn expect_str(value: Value, what: &'static str) -> Result<String, CodecError> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(CodecError::unexpected(what, &other)),
    }
}

fn invalid(what: &'static str, e: impl fmt::Display) -> CodecError {
    CodecError::Decode(format!("invalid {what}: {e}"))
}

fn build_default_table() -> TranslationTable {
    TranslationTable::new()
        .with(
            DATE_CODE,
            |d: &NaiveDate| Value::Str(d.format("%Y-%m-%d").to_string()),
            |v| {
                expect_str(v, "date")?
                    .parse::<NaiveDate>()
                    .map_err(|e| invalid("date", e))
            },
        )
        .with(
            DATETIME_CODE,
            |dt: &DateTime<FixedOffset>| Value::Str(dt.to_rfc3339()),
            |v| DateTime::parse_from_rfc3339(&expect_str(v, "datetime")?).map_err(|e| invalid("datetime", e)),
        )
        .with(
            TIME_CODE,
            |t: &NaiveTime| Value::Str(t.format("%H:%M:%S%.f").to_string()),
            |v| {
                NaiveTime::parse_from_str(&expect_str(v, "time")?, "%H:%M:%S%.f")
                    .map_err(|e| invalid("time", e))
            },
        )
        .with(
            TIMEDELTA_CODE,
            |d: &TimeDelta| {
                Value::Array(vec![
                    Value::Int(d.num_seconds()),
                    Value::Int(i64::from(d.subsec_nanos())),
                ])
            },
            |v| {
                let parts = match v {
                    Value::Array(parts) if parts.len() == 2 => parts,
                    other => return Err(CodecError::unexpected("timedelta", &other)),
                };
                let secs = parts[0].as_i64().ok_or_else(|| invalid("timedelta", "seconds"))?;
                let nanos = parts[1].as_i64().ok_or_else(|| invalid("timedelta", "nanoseconds"))?;
                TimeDelta::try_seconds(secs)
                    .and_then(|d| d.checked_add(&TimeDelta::nanoseconds(nanos)))
                    .ok_or_else(|| invalid("timedelta", "out of range"))
            },
        )
        .with(
            TIMEZONE_CODE,
            |tz: &FixedOffset| Value::Int(i64::from(tz.local_minus_utc())),
            |v| {
                v.as_i64()
                    .and_then(|secs| i32::try_from(secs).ok())
                    .and_then(FixedOffset::east_opt)
                    .ok_or_else(|| invalid("timezone", "offset out of range"))
            },
        )
}

/// Packs and unpacks [`Value`]s.
#[derive(Clone, Debug)]
pub struct Codec {
    table: Arc<TranslationTable>,
    defaults: &'static TranslationTable,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Codec {
    /// Codec using `table` in front of the default table.
    pub fn new(table: Option<TranslationTable>) -> Self {
        Self {
            table: Arc::new(table.unwrap_or_default()),
            defaults: TranslationTable::default_table(),
        }
    }

    pub fn pack(&self, value: &Value) -> Result<Bytes, CodecError> {
        let raw = self.to_rmpv(value)?;
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &raw).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    /// Unpack exactly one value; trailing bytes are an error.
    pub fn unpack(&self, data: &[u8]) -> Result<Value, CodecError> {
        let mut cursor = data;
        let raw = rmpv::decode::read_value(&mut cursor).map_err(|e| CodecError::Decode(e.to_string()))?;
        if !cursor.is_empty() {
            return Err(CodecError::TrailingBytes(cursor.len()));
        }
        self.from_rmpv(raw)
    }

    pub fn pack_args(&self, args: &[Value]) -> Result<Bytes, CodecError> {
        self.pack(&Value::Array(args.to_vec()))
    }

    pub fn pack_kwargs(&self, kwargs: &Kwargs) -> Result<Bytes, CodecError> {
        self.pack(&Value::from(kwargs.clone()))
    }

    pub fn unpack_args(&self, data: &[u8]) -> Result<Vec<Value>, CodecError> {
        match self.unpack(data)? {
            Value::Array(items) => Ok(items),
            other => Err(CodecError::unexpected("array", &other)),
        }
    }

    /// Unpack a map with string keys.
    pub fn unpack_kwargs(&self, data: &[u8]) -> Result<Kwargs, CodecError> {
        match self.unpack(data)? {
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| match k {
                    Value::Str(k) => Ok((k, v)),
                    other => Err(CodecError::unexpected("str key", &other)),
                })
                .collect(),
            other => Err(CodecError::unexpected("map", &other)),
        }
    }

    fn to_rmpv(&self, value: &Value) -> Result<rmpv::Value, CodecError> {
        Ok(match value {
            Value::Nil => rmpv::Value::Nil,
            Value::Bool(b) => rmpv::Value::Boolean(*b),
            Value::Int(i) => rmpv::Value::Integer(Integer::from(*i)),
            Value::UInt(u) => rmpv::Value::Integer(Integer::from(*u)),
            Value::Float(f) => rmpv::Value::F64(*f),
            Value::Str(s) => rmpv::Value::String(Utf8String::from(s.as_str())),
            Value::Bin(b) => rmpv::Value::Binary(b.to_vec()),
            Value::Array(items) => {
                rmpv::Value::Array(items.iter().map(|v| self.to_rmpv(v)).collect::<Result<_, _>>()?)
            }
            Value::Map(entries) => rmpv::Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((self.to_rmpv(k)?, self.to_rmpv(v)?)))
                    .collect::<Result<_, CodecError>>()?,
            ),
            Value::Ext(code, data) => rmpv::Value::Ext(*code, data.to_vec()),
            Value::Object(obj) => {
                let type_id = obj.value_type_id();
                let (code, translation) = self
                    .table
                    .find_type(type_id)
                    .or_else(|| self.defaults.find_type(type_id))
                    .ok_or(CodecError::NoTranslation(obj.type_name()))?;
                let payload = self.pack(&(translation.pack)(obj)?)?;
                rmpv::Value::Ext(code, payload.to_vec())
            }
        })
    }

    fn from_rmpv(&self, raw: rmpv::Value) -> Result<Value, CodecError> {
        Ok(match raw {
            rmpv::Value::Nil => Value::Nil,
            rmpv::Value::Boolean(b) => Value::Bool(b),
            rmpv::Value::Integer(i) => match (i.as_i64(), i.as_u64()) {
                (Some(v), _) => Value::Int(v),
                (None, Some(v)) => Value::UInt(v),
                (None, None) => return Err(CodecError::Decode(format!("integer out of range: {i}"))),
            },
            rmpv::Value::F32(f) => Value::Float(f64::from(f)),
            rmpv::Value::F64(f) => Value::Float(f),
            rmpv::Value::String(s) => Value::Str(s.into_str().ok_or(CodecError::InvalidUtf8)?),
            rmpv::Value::Binary(b) => Value::Bin(Bytes::from(b)),
            rmpv::Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.from_rmpv(v)).collect::<Result<_, _>>()?)
            }
            rmpv::Value::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((self.from_rmpv(k)?, self.from_rmpv(v)?)))
                    .collect::<Result<_, CodecError>>()?,
            ),
            rmpv::Value::Ext(code, data) => {
                match self.table.get(code).or_else(|| self.defaults.get(code)) {
                    Some(translation) => Value::Object((translation.unpack)(self.unpack(&data)?)?),
                    None => Value::Ext(code, Bytes::from(data)),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{args, kwargs};
    use chrono::TimeZone;

    #[derive(Debug, PartialEq)]
    struct Point {
        x: i64,
        y: i64,
    }

    fn point_table(code: i8) -> TranslationTable {
        TranslationTable::new().with(
            code,
            |p: &Point| Value::Array(vec![Value::Int(p.x), Value::Int(p.y)]),
            |v| match v.as_array() {
                Some([x, y]) => Ok(Point {
                    x: x.as_i64().unwrap_or_default(),
                    y: y.as_i64().unwrap_or_default(),
                }),
                _ => Err(CodecError::Decode("bad point".into())),
            },
        )
    }

    #[test]
    fn test_plain_values() {
        let codec = Codec::default();
        let value = Value::Array(vec![
            Value::Nil,
            Value::Bool(true),
            Value::Int(-5),
            Value::UInt(u64::MAX),
            Value::Float(1.25),
            Value::from("héllo"),
            Value::Bin(Bytes::from_static(b"\x00\xff")),
            Value::from(kwargs! { "k" => 1 }),
        ]);
        let packed = codec.pack(&value).unwrap();
        assert_eq!(codec.unpack(&packed).unwrap(), value);
    }

    #[test]
    fn test_default_table_codes() {
        assert_eq!(
            TranslationTable::default_table().codes(),
            vec![TIMEZONE_CODE, TIMEDELTA_CODE, TIME_CODE, DATETIME_CODE, DATE_CODE]
        );
    }

    #[test]
    fn test_chrono_values() {
        let codec = Codec::default();
        let tz = FixedOffset::east_opt(3 * 3600).unwrap();
        let values = vec![
            Value::from(Object::new(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())),
            Value::from(Object::new(tz.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap())),
            Value::from(Object::new(NaiveTime::from_hms_micro_opt(23, 59, 1, 250).unwrap())),
            Value::from(Object::new(TimeDelta::milliseconds(-1500))),
            Value::from(Object::new(tz)),
        ];
        for value in values {
            let packed = codec.pack(&value).unwrap();
            assert_eq!(codec.unpack(&packed).unwrap(), value, "value {value}");
        }
    }

    #[test]
    fn test_date_uses_extension_code() {
        let codec = Codec::default();
        let date = Value::from(Object::new(NaiveDate::from_ymd_opt(2020, 1, 2).unwrap()));
        let packed = codec.pack(&date).unwrap();
        let mut cursor = &packed[..];
        match rmpv::decode::read_value(&mut cursor).unwrap() {
            rmpv::Value::Ext(code, _) => assert_eq!(code, DATE_CODE),
            other => panic!("expected ext, got {other:?}"),
        }
    }

    #[test]
    fn test_user_table() {
        let codec = Codec::new(Some(point_table(1)));
        let value = Value::from(Object::new(Point { x: 3, y: -4 }));
        let packed = codec.pack(&value).unwrap();
        assert_eq!(codec.unpack(&packed).unwrap(), value);

        // Without the entry the payload stays an opaque extension.
        match Codec::default().unpack(&packed).unwrap() {
            Value::Ext(1, _) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_user_entry_takes_precedence() {
        let table = TranslationTable::new().with(
            DATE_CODE,
            |p: &Point| Value::Int(p.x),
            |v| Ok(Point { x: v.as_i64().unwrap_or_default(), y: 0 }),
        );
        let codec = Codec::new(Some(table));
        let packed = codec.pack(&Value::from(Object::new(Point { x: 9, y: 0 }))).unwrap();
        assert_eq!(
            codec.unpack(&packed).unwrap().as_object::<Point>(),
            Some(&Point { x: 9, y: 0 })
        );
    }

    #[test]
    fn test_unregistered_object_fails() {
        let err = Codec::default()
            .pack(&Value::from(Object::new(Point { x: 0, y: 0 })))
            .unwrap_err();
        assert!(matches!(err, CodecError::NoTranslation(name) if name.ends_with("Point")));
    }

    #[test]
    fn test_args_and_kwargs() {
        let codec = Codec::default();
        let packed = codec.pack_args(&args![1, "a"]).unwrap();
        assert_eq!(codec.unpack_args(&packed).unwrap(), args![1, "a"]);

        let kw = kwargs! { "a" => 1, "b" => 2.0 };
        let packed = codec.pack_kwargs(&kw).unwrap();
        assert_eq!(codec.unpack_kwargs(&packed).unwrap(), kw);

        assert!(codec.unpack_args(&codec.pack(&Value::Int(1)).unwrap()).is_err());
        let int_keys = codec.pack(&Value::Map(vec![(Value::Int(1), Value::Nil)])).unwrap();
        assert!(codec.unpack_kwargs(&int_keys).is_err());
    }

    #[test]
    fn test_trailing_bytes() {
        let codec = Codec::default();
        let mut packed = codec.pack(&Value::Int(1)).unwrap().to_vec();
        packed.push(0xc0);
        assert!(matches!(codec.unpack(&packed), Err(CodecError::TrailingBytes(1))));
        assert!(codec.unpack(&[0xc1]).is_err());
    }
}
