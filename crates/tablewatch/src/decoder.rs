//! Change message decoding
//!
//! A message body is the JSON document written by the trigger. Every mapped
//! column found in it is coerced to the canonical JSON form of its field kind
//! (decimals as exact strings, binary as byte arrays, temporal values in
//! chrono's textual form) and the resulting object is deserialized into the
//! model with serde. Absent and NULL columns are skipped so the field keeps
//! its `#[serde(default)]` value.

use crate::error::{Result, TableWatchError};
use crate::event::{ChangeEvent, ChangeType};
use crate::mapper::ColumnMapping;
use crate::model::{FieldKind, TableModel};
use crate::naming::NamingConvention;
use crate::schema::{ColumnDescriptor, TableDescriptor};
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::str::FromStr;
use tracing::trace;
use uuid::Uuid;

/// Character types whose content is parsed with the configured culture
const TEXT_TYPES: &[&str] = &["char", "varchar", "nchar", "nvarchar"];

/// Order of day, month and year in culture-specific dates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DateOrder {
    YearMonthDay,
    DayMonthYear,
    MonthDayYear,
}

/// Number and date conventions used to parse text columns into typed fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Culture {
    pub name: String,
    pub decimal_separator: char,
    pub group_separator: Option<char>,
    pub date_order: DateOrder,
}

impl Default for Culture {
    fn default() -> Self {
        Self::invariant()
    }
}

impl Culture {
    /// `.` decimals, no grouping, ISO dates
    pub fn invariant() -> Self {
        Self {
            name: "invariant".to_string(),
            decimal_separator: '.',
            group_separator: None,
            date_order: DateOrder::YearMonthDay,
        }
    }

    /// Look up a culture by name (`en-US`, `de-DE`, ...)
    pub fn named(name: &str) -> Result<Self> {
        let (decimal_separator, group_separator, date_order) = match name.to_ascii_lowercase().as_str() {
            "" | "invariant" => return Ok(Self::invariant()),
            "en-us" => ('.', Some(','), DateOrder::MonthDayYear),
            "en-gb" | "en-au" | "en-ie" => ('.', Some(','), DateOrder::DayMonthYear),
            "de-de" | "de-at" | "it-it" | "es-es" | "nl-nl" | "pt-br" | "da-dk" => {
                (',', Some('.'), DateOrder::DayMonthYear)
            }
            "fr-fr" | "fr-be" | "ru-ru" | "pl-pl" | "sv-se" | "nb-no" | "fi-fi" | "cs-cz" => {
                (',', Some('\u{a0}'), DateOrder::DayMonthYear)
            }
            "de-ch" => ('.', Some('\''), DateOrder::DayMonthYear),
            "ja-jp" | "zh-cn" | "ko-kr" | "hu-hu" => ('.', Some(','), DateOrder::YearMonthDay),
            _ => {
                return Err(TableWatchError::config(format!(
                    "unknown culture '{}'",
                    name
                )))
            }
        };
        Ok(Self {
            name: name.to_string(),
            decimal_separator,
            group_separator,
            date_order,
        })
    }

    /// Rewrite a localized number into invariant form
    fn normalize_number(&self, text: &str) -> String {
        text.trim()
            .chars()
            .filter(|c| {
                Some(*c) != self.group_separator
                    && !(self.group_separator == Some('\u{a0}') && (*c == ' ' || *c == '\u{202f}'))
            })
            .map(|c| if c == self.decimal_separator { '.' } else { c })
            .collect()
    }

    fn date_formats(&self) -> &'static [&'static str] {
        match self.date_order {
            DateOrder::YearMonthDay => &["%Y/%m/%d", "%Y.%m.%d", "%Y-%m-%d"],
            DateOrder::DayMonthYear => &["%d/%m/%Y", "%d.%m.%Y", "%d-%m-%Y"],
            DateOrder::MonthDayYear => &["%m/%d/%Y", "%m.%d.%Y", "%m-%d-%Y"],
        }
    }

    fn parse_date(&self, text: &str) -> Option<NaiveDate> {
        self.date_formats()
            .iter()
            .find_map(|f| NaiveDate::parse_from_str(text.trim(), f).ok())
    }

    fn parse_datetime(&self, text: &str) -> Option<NaiveDateTime> {
        let text = text.trim();
        for date_format in self.date_formats() {
            for time_format in ["%H:%M:%S%.f", "%H:%M"] {
                let format = format!("{} {}", date_format, time_format);
                if let Ok(dt) = NaiveDateTime::parse_from_str(text, &format) {
                    return Some(dt);
                }
            }
        }
        self.parse_date(text)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
    }
}

/// Map a queue message type back to its change type
pub fn change_type_of(naming: &NamingConvention, message_type: &str) -> Option<ChangeType> {
    ChangeType::ALL
        .into_iter()
        .find(|c| naming.message_type(*c) == message_type)
}

/// Turns message bodies into [`ChangeEvent`]s
#[derive(Debug, Clone)]
pub struct RecordDecoder {
    mapping: ColumnMapping,
    table: TableDescriptor,
    culture: Option<Culture>,
}

impl RecordDecoder {
    pub fn new(mapping: ColumnMapping, table: TableDescriptor) -> Self {
        Self {
            mapping,
            table,
            culture: None,
        }
    }

    /// Parse text columns with a culture instead of invariant rules
    pub fn with_culture(mut self, culture: Option<Culture>) -> Self {
        self.culture = culture;
        self
    }

    pub fn mapping(&self) -> &ColumnMapping {
        &self.mapping
    }

    /// Decode one message body
    pub fn decode<T: TableModel>(&self, change_type: ChangeType, body: &str) -> Result<ChangeEvent<T>> {
        let document: Value = serde_json::from_str(body)
            .map_err(|e| TableWatchError::decode(format!("malformed message body: {}", e)))?;
        let Value::Object(mut document) = document else {
            return Err(TableWatchError::decode("message body is not a JSON object"));
        };

        let row = match document.remove("row") {
            Some(Value::Object(row)) => row,
            None | Some(Value::Null) => Map::new(),
            Some(other) => {
                return Err(TableWatchError::decode(format!(
                    "'row' must be an object, got {}",
                    other
                )))
            }
        };

        let entity = self.materialize::<T>(&row)?;
        let mut event = ChangeEvent::new(change_type, entity, Map::new());

        if change_type == ChangeType::Update {
            if let Some(Value::Object(old)) = document.remove("old") {
                event = event.with_old_entity(self.materialize::<T>(&old)?);
            }
        }

        event.raw_values = row;
        trace!("Decoded {} message", change_type);
        Ok(event)
    }

    fn materialize<T: TableModel>(&self, row: &Map<String, Value>) -> Result<T> {
        let mut fields = Map::with_capacity(self.mapping.len());

        for entry in self.mapping.entries() {
            let value = row.get(&entry.column).or_else(|| {
                row.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(&entry.column))
                    .map(|(_, v)| v)
            });
            let Some(value) = value.filter(|v| !v.is_null()) else {
                continue;
            };

            let column = self.table.column(&entry.column);
            let coerced = self.coerce(entry.kind, column, value).map_err(|reason| {
                TableWatchError::decode(format!(
                    "column '{}' -> field '{}' ({:?}): {}",
                    entry.column, entry.field, entry.kind, reason
                ))
            })?;
            fields.insert(entry.field.clone(), coerced);
        }

        serde_json::from_value(Value::Object(fields)).map_err(|e| {
            TableWatchError::decode(format!(
                "cannot materialize {}: {}",
                std::any::type_name::<T>(),
                e
            ))
        })
    }

    /// Culture applied to a column, if any
    fn culture_for(&self, column: Option<&ColumnDescriptor>) -> Option<&Culture> {
        let is_text = column.is_some_and(|c| TEXT_TYPES.contains(&c.native_type.as_str()));
        if is_text {
            self.culture.as_ref()
        } else {
            None
        }
    }

    fn coerce(
        &self,
        kind: FieldKind,
        column: Option<&ColumnDescriptor>,
        value: &Value,
    ) -> std::result::Result<Value, String> {
        let culture = self.culture_for(column);

        match kind {
            FieldKind::Raw => Ok(value.clone()),
            FieldKind::Bool => coerce_bool(value).map(Value::Bool),
            FieldKind::U8 => coerce_integer(value, culture, u8::MIN as i64, u8::MAX as i64),
            FieldKind::I16 => coerce_integer(value, culture, i16::MIN as i64, i16::MAX as i64),
            FieldKind::I32 => coerce_integer(value, culture, i32::MIN as i64, i32::MAX as i64),
            FieldKind::I64 => coerce_integer(value, culture, i64::MIN, i64::MAX),
            FieldKind::Enum => coerce_integer(value, None, i64::MIN, i64::MAX),
            FieldKind::F32 | FieldKind::F64 => {
                let f = coerce_float(value, culture)?;
                if kind == FieldKind::F32 && f.is_finite() && f.abs() > f32::MAX as f64 {
                    return Err(format!("{} overflows f32", f));
                }
                Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(|| format!("{} is not a finite number", f))
            }
            FieldKind::Decimal => coerce_decimal(value, culture).map(|d| Value::String(d.to_string())),
            FieldKind::String => Ok(Value::String(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })),
            FieldKind::Bytes => {
                let text = expect_str(value)?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(text)
                    .map_err(|e| format!("invalid base64: {}", e))?;
                Ok(Value::Array(bytes.into_iter().map(Value::from).collect()))
            }
            FieldKind::Date => {
                let text = expect_str(value)?;
                let date = parse_iso_date(text)
                    .or_else(|| culture.and_then(|c| c.parse_date(text)))
                    .ok_or_else(|| format!("'{}' is not a date", text))?;
                Ok(Value::String(date.format("%Y-%m-%d").to_string()))
            }
            FieldKind::Time => {
                let text = expect_str(value)?;
                let time = NaiveTime::parse_from_str(text.trim(), "%H:%M:%S%.f")
                    .or_else(|_| NaiveTime::parse_from_str(text.trim(), "%H:%M"))
                    .map_err(|_| format!("'{}' is not a time of day", text))?;
                Ok(Value::String(time.format("%H:%M:%S%.f").to_string()))
            }
            FieldKind::DateTime => {
                let text = expect_str(value)?;
                let dt = parse_iso_datetime(text)
                    .or_else(|| culture.and_then(|c| c.parse_datetime(text)))
                    .ok_or_else(|| format!("'{}' is not a date and time", text))?;
                Ok(Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            }
            FieldKind::DateTimeOffset => {
                let text = expect_str(value)?;
                let dto = DateTime::parse_from_rfc3339(text.trim())
                    .or_else(|_| DateTime::parse_from_str(text.trim(), "%Y-%m-%d %H:%M:%S%.f %:z"))
                    .map_err(|_| format!("'{}' is not a date and time with offset", text))?;
                Ok(Value::String(dto.to_rfc3339_opts(SecondsFormat::AutoSi, false)))
            }
            FieldKind::Uuid => {
                let text = expect_str(value)?;
                let uuid = Uuid::parse_str(text.trim()).map_err(|e| format!("invalid uuid: {}", e))?;
                Ok(Value::String(uuid.to_string()))
            }
        }
    }
}

fn expect_str(value: &Value) -> std::result::Result<&str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("expected a string, got {}", value))
}

fn coerce_bool(value: &Value) -> std::result::Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(format!("{} is not a bit value", n)),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(format!("'{}' is not a boolean", s)),
        },
        other => Err(format!("{} is not a boolean", other)),
    }
}

fn coerce_integer(
    value: &Value,
    culture: Option<&Culture>,
    min: i64,
    max: i64,
) -> std::result::Result<Value, String> {
    let n = match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => i,
            None => match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                    f as i64
                }
                _ => return Err(format!("{} is not an integer", n)),
            },
        },
        Value::Bool(b) => i64::from(*b),
        Value::String(s) => {
            let normalized = match culture {
                Some(c) => c.normalize_number(s),
                None => s.trim().to_string(),
            };
            normalized
                .parse::<i64>()
                .map_err(|_| format!("'{}' is not an integer", s))?
        }
        other => return Err(format!("{} is not an integer", other)),
    };

    if n < min || n > max {
        return Err(format!("{} is out of range [{}, {}]", n, min, max));
    }
    Ok(Value::from(n))
}

fn coerce_float(value: &Value, culture: Option<&Culture>) -> std::result::Result<f64, String> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("{} is not a number", n)),
        Value::String(s) => {
            let normalized = match culture {
                Some(c) => c.normalize_number(s),
                None => s.trim().to_string(),
            };
            normalized
                .parse::<f64>()
                .map_err(|_| format!("'{}' is not a number", s))
        }
        other => Err(format!("{} is not a number", other)),
    }
}

fn coerce_decimal(value: &Value, culture: Option<&Culture>) -> std::result::Result<Decimal, String> {
    let text = match value {
        // exact only for values the trigger did not project as text
        Value::Number(n) => n.to_string(),
        Value::String(s) => match culture {
            Some(c) => c.normalize_number(s),
            None => s.trim().to_string(),
        },
        other => return Err(format!("{} is not a decimal", other)),
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| format!("'{}' is not a decimal: {}", text, e))
}

fn parse_iso_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_iso_datetime(text).map(|dt| dt.date()))
}

fn parse_iso_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::ModelToTableMapper;
    use crate::model::{ModelField, RawRecord};
    use chrono::FixedOffset;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    enum Tier {
        #[default]
        Basic,
        Gold,
    }

    impl<'de> Deserialize<'de> for Tier {
        fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
            match i32::deserialize(d)? {
                0 => Ok(Tier::Basic),
                1 => Ok(Tier::Gold),
                n => Err(serde::de::Error::custom(format!("unknown tier {}", n))),
            }
        }
    }

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default)]
    struct Product {
        id: i32,
        name: String,
        price: Decimal,
        weight: f64,
        stock: u8,
        active: bool,
        released: Option<NaiveDate>,
        opens: Option<NaiveTime>,
        modified: Option<NaiveDateTime>,
        stamped: Option<DateTime<FixedOffset>>,
        key: Option<Uuid>,
        blob: Vec<u8>,
        tier: Tier,
        note: Option<String>,
    }

    impl TableModel for Product {
        fn fields() -> Vec<ModelField> {
            vec![
                ModelField::new("id", FieldKind::I32),
                ModelField::new("name", FieldKind::String),
                ModelField::new("price", FieldKind::Decimal),
                ModelField::new("weight", FieldKind::F64),
                ModelField::new("stock", FieldKind::U8),
                ModelField::new("active", FieldKind::Bool),
                ModelField::new("released", FieldKind::Date),
                ModelField::new("opens", FieldKind::Time),
                ModelField::new("modified", FieldKind::DateTime),
                ModelField::new("stamped", FieldKind::DateTimeOffset),
                ModelField::new("key", FieldKind::Uuid),
                ModelField::new("blob", FieldKind::Bytes),
                ModelField::new("tier", FieldKind::Enum),
                ModelField::new("note", FieldKind::String),
            ]
        }
    }

    fn table() -> TableDescriptor {
        TableDescriptor::new(
            "dbo",
            "Product",
            vec![
                ColumnDescriptor::new("Id", "int").primary_key(1),
                ColumnDescriptor::new("Name", "nvarchar"),
                ColumnDescriptor::new("Price", "decimal").with_precision(18, 4),
                ColumnDescriptor::new("Weight", "float"),
                ColumnDescriptor::new("Stock", "tinyint"),
                ColumnDescriptor::new("Active", "bit"),
                ColumnDescriptor::new("Released", "date"),
                ColumnDescriptor::new("Opens", "time"),
                ColumnDescriptor::new("Modified", "datetime2"),
                ColumnDescriptor::new("Stamped", "datetimeoffset"),
                ColumnDescriptor::new("Key", "uniqueidentifier"),
                ColumnDescriptor::new("Blob", "varbinary"),
                ColumnDescriptor::new("Tier", "int"),
                ColumnDescriptor::new("Note", "nvarchar"),
            ],
        )
    }

    fn decoder() -> RecordDecoder {
        let table = table();
        let mapping = ModelToTableMapper::new().resolve::<Product>(&table).unwrap();
        RecordDecoder::new(mapping, table)
    }

    #[test]
    fn test_decode_all_kinds() {
        let body = json!({
            "row": {
                "Id": 7,
                "Name": "Widget",
                "Price": "12.3400",
                "Weight": 1.5,
                "Stock": 200,
                "Active": true,
                "Released": "2024-02-29",
                "Opens": "08:30:00.1234567",
                "Modified": "2024-03-01T10:20:30.1234567",
                "Stamped": "2024-03-01T10:20:30.5+02:00",
                "Key": "6F9619FF-8B86-D011-B42D-00C04FC964FF",
                "Blob": "AQID",
                "Tier": 1
            }
        })
        .to_string();

        let event: ChangeEvent<Product> = decoder().decode(ChangeType::Insert, &body).unwrap();
        let p = &event.entity;
        assert_eq!(p.id, 7);
        assert_eq!(p.name, "Widget");
        assert_eq!(p.price.to_string(), "12.3400");
        assert_eq!(p.weight, 1.5);
        assert_eq!(p.stock, 200);
        assert!(p.active);
        assert_eq!(p.released, NaiveDate::from_ymd_opt(2024, 2, 29));
        assert_eq!(
            p.opens,
            NaiveTime::from_hms_nano_opt(8, 30, 0, 123_456_700)
        );
        assert_eq!(
            p.modified.unwrap().and_utc().timestamp_subsec_nanos(),
            123_456_700
        );
        assert_eq!(p.stamped.unwrap().offset().local_minus_utc(), 7200);
        assert_eq!(
            p.key.unwrap().to_string(),
            "6f9619ff-8b86-d011-b42d-00c04fc964ff"
        );
        assert_eq!(p.blob, vec![1, 2, 3]);
        assert_eq!(p.tier, Tier::Gold);
        assert_eq!(p.note, None);
        assert!(event.old_entity.is_none());
        assert_eq!(event.raw_value("price"), Some(&json!("12.3400")));
    }

    #[test]
    fn test_absent_and_null_columns_keep_defaults() {
        let body = r#"{"row":{"Id":1,"Name":null}}"#;
        let event: ChangeEvent<Product> = decoder().decode(ChangeType::Delete, body).unwrap();
        assert_eq!(event.entity.id, 1);
        assert_eq!(event.entity.name, "");
        assert_eq!(event.entity.price, Decimal::ZERO);
    }

    #[test]
    fn test_old_values_only_on_update() {
        let body = r#"{"row":{"Id":1,"Name":"new"},"old":{"Id":1,"Name":"old"}}"#;
        let event: ChangeEvent<Product> = decoder().decode(ChangeType::Update, body).unwrap();
        assert_eq!(event.entity.name, "new");
        assert_eq!(event.old_entity.unwrap().name, "old");

        let event: ChangeEvent<Product> = decoder().decode(ChangeType::Insert, body).unwrap();
        assert!(event.old_entity.is_none());
    }

    #[test]
    fn test_coercion_failures() {
        let d = decoder();
        for body in [
            r#"{"row":{"Stock":256}}"#,
            r#"{"row":{"Id":"abc"}}"#,
            r#"{"row":{"Blob":"***"}}"#,
            r#"{"row":{"Released":"yesterday"}}"#,
            r#"{"row":{"Tier":9}}"#,
            r#"{"row":5}"#,
            "not json",
            "[]",
        ] {
            let err = d.decode::<Product>(ChangeType::Insert, body).unwrap_err();
            assert!(matches!(err, TableWatchError::Decode(_)), "{}", body);
        }
    }

    #[test]
    fn test_culture_applies_to_text_columns_only() {
        #[derive(Debug, Default, Deserialize)]
        #[serde(default)]
        struct Imported {
            amount: Decimal,
            booked: Option<NaiveDate>,
            price: Decimal,
        }

        impl TableModel for Imported {
            fn fields() -> Vec<ModelField> {
                vec![
                    ModelField::new("amount", FieldKind::Decimal),
                    ModelField::new("booked", FieldKind::Date),
                    ModelField::new("price", FieldKind::Decimal),
                ]
            }
        }

        let table = TableDescriptor::new(
            "dbo",
            "Imported",
            vec![
                ColumnDescriptor::new("Amount", "nvarchar"),
                ColumnDescriptor::new("Booked", "varchar"),
                ColumnDescriptor::new("Price", "decimal"),
            ],
        );
        let mapping = ModelToTableMapper::new().resolve::<Imported>(&table).unwrap();
        let body = r#"{"row":{"Amount":"1.234,50","Booked":"31.12.2023","Price":"1234.50"}}"#;

        let invariant = RecordDecoder::new(mapping.clone(), table.clone());
        assert!(invariant.decode::<Imported>(ChangeType::Insert, body).is_err());

        let german = RecordDecoder::new(mapping, table)
            .with_culture(Some(Culture::named("de-DE").unwrap()));
        let event = german.decode::<Imported>(ChangeType::Insert, body).unwrap();
        assert_eq!(event.entity.amount.to_string(), "1234.50");
        assert_eq!(event.entity.booked, NaiveDate::from_ymd_opt(2023, 12, 31));
        assert_eq!(event.entity.price.to_string(), "1234.50");
    }

    #[test]
    fn test_unknown_culture() {
        assert!(Culture::named("xx-YY").is_err());
        assert_eq!(Culture::named("").unwrap(), Culture::invariant());
    }

    #[test]
    fn test_dynamic_rows_pass_values_through() {
        let table = table();
        let mapping = ModelToTableMapper::new().resolve::<RawRecord>(&table).unwrap();
        let decoder = RecordDecoder::new(mapping, table);
        let event: ChangeEvent<RawRecord> = decoder
            .decode(ChangeType::Insert, r#"{"row":{"Id":3,"Price":"1.50"}}"#)
            .unwrap();
        assert_eq!(event.entity.get("Id"), Some(&json!(3)));
        assert_eq!(event.entity.get("Price"), Some(&json!("1.50")));
    }

    #[test]
    fn test_change_type_of() {
        let naming = NamingConvention::adopt("T_1").unwrap();
        assert_eq!(change_type_of(&naming, "T_1/Update"), Some(ChangeType::Update));
        assert_eq!(change_type_of(&naming, "T_2/Update"), None);
    }
}
