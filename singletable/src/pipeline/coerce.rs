// Write/read type coercion per declared field type

use crate::error::{Result, SingleTableError};
use crate::expression::Op;
use crate::hooks::{AttributeTransform, Cipher, Direction};
use crate::schema::{Field, FieldType};
use crate::value::{iso_string, Condition, Properties, Value};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::sync::Arc;

/// Collaborators consulted while coercing one attribute.
pub(crate) struct Coercion<'a> {
    pub model: &'a str,
    pub transform: Option<&'a Arc<dyn AttributeTransform>>,
    pub cipher: Option<&'a Arc<dyn Cipher>>,
}

impl Coercion<'_> {
    /// Coerce a selected value for storage.
    pub fn write(&self, op: Op, field: &Field, value: Value, properties: &Properties) -> Result<Value> {
        let value = if let Some(transform) = self.transform {
            transform.transform(self.model, Direction::Write, &field.name, value, properties)?
        } else if value.is_null() && field.nulls {
            value
        } else if op == Op::Find && matches!(value, Value::Condition(_) | Value::Object(_)) {
            match value {
                Value::Condition(condition) => Value::Condition(write_condition(field, condition)?),
                other => write_nested(field, other)?,
            }
        } else {
            self.write_typed(field, value)?
        };

        if field.crypt && !value.is_null() {
            return self.encrypt(field, &value);
        }
        Ok(value)
    }

    fn write_typed(&self, field: &Field, value: Value) -> Result<Value> {
        Ok(match field.field_type {
            FieldType::Date => write_date(field, &value)?,
            FieldType::Number => match to_number(&value) {
                Some(n) => Value::Number(n),
                None => {
                    return Err(SingleTableError::validation(
                        &field.name,
                        format!(
                            "Invalid value \"{value}\" provided for field \"{}\"",
                            field.name
                        ),
                    ))
                }
            },
            FieldType::Boolean => Value::Bool(truthy(&value)),
            FieldType::String => match value {
                Value::Null | Value::String(_) => value,
                other => Value::String(other.to_text().unwrap_or_else(|| other.to_json().to_string())),
            },
            FieldType::Binary => match value {
                Value::Binary(bytes) => Value::String(BASE64.encode(bytes)),
                other => other,
            },
            FieldType::Array => match value {
                Value::Array(_) | Value::Null => value,
                Value::String(s) if s.is_empty() => Value::Array(Vec::new()),
                _ => {
                    return Err(SingleTableError::Argument(format!(
                        "Invalid data type for Array field \"{}\" in \"{}\"",
                        field.name, self.model
                    )))
                }
            },
            FieldType::Set => match value {
                Value::Array(items) => Value::Array(write_set(items)),
                other => other,
            },
            FieldType::Object => match value {
                Value::Object(_) | Value::Array(_) => write_nested(field, value)?,
                other => other,
            },
            FieldType::Custom(_) => value,
        })
    }

    fn encrypt(&self, field: &Field, value: &Value) -> Result<Value> {
        let cipher = self.cipher.ok_or_else(|| {
            SingleTableError::Crypt(format!(
                "Field \"{}\" in \"{}\" is encrypted but no cipher is configured",
                field.name, self.model
            ))
        })?;
        let text = value
            .to_text()
            .unwrap_or_else(|| value.to_json().to_string());
        Ok(Value::String(cipher.encrypt(&text, "primary")?))
    }

    /// Convert a stored value back to its application type.
    pub fn read(&self, field: &Field, value: Value, properties: &Properties) -> Result<Value> {
        if let Some(transform) = self.transform {
            return transform.transform(self.model, Direction::Read, &field.name, value, properties);
        }
        Ok(match field.field_type {
            FieldType::Date => read_date(field, value),
            FieldType::Binary => match value {
                Value::String(text) => match BASE64.decode(text.as_bytes()) {
                    Ok(bytes) => Value::Binary(bytes),
                    Err(_) => Value::String(text),
                },
                other => other,
            },
            _ => value,
        })
    }

    pub fn decrypt(&self, field: &Field, value: Value) -> Result<Value> {
        match (value, self.cipher) {
            (Value::String(text), Some(cipher)) => Ok(Value::String(cipher.decrypt(&text)?)),
            (Value::String(_), None) => Err(SingleTableError::Crypt(format!(
                "Field \"{}\" in \"{}\" is encrypted but no cipher is configured",
                field.name, self.model
            ))),
            (other, _) => Ok(other),
        }
    }
}

/// Encode a date under the field's policy: epoch seconds for TTL fields,
/// ISO-8601 text with `iso_dates`, otherwise epoch milliseconds.
pub fn encode_date(field: &Field, date: &DateTime<Utc>) -> Value {
    if field.ttl {
        Value::Number((date.timestamp_millis() as f64 / 1000.0).ceil())
    } else if field.iso_dates {
        Value::String(iso_string(date))
    } else {
        Value::Number(date.timestamp_millis() as f64)
    }
}

pub fn write_date(field: &Field, value: &Value) -> Result<Value> {
    match value {
        Value::Date(date) => Ok(encode_date(field, date)),
        Value::String(text) => {
            let date = parse_date(text).ok_or_else(|| {
                SingleTableError::validation(
                    &field.name,
                    format!("Invalid date \"{text}\" provided for field \"{}\"", field.name),
                )
            })?;
            Ok(encode_date(field, &date))
        }
        Value::Number(millis) if field.ttl => Ok(Value::Number((millis / 1000.0).ceil())),
        Value::Number(millis) if field.iso_dates => Ok(from_millis(*millis)
            .map(|d| Value::String(iso_string(&d)))
            .unwrap_or_else(|| value.clone())),
        other => Ok(other.clone()),
    }
}

fn read_date(field: &Field, value: Value) -> Value {
    match value {
        Value::Number(n) => {
            let millis = if field.ttl { n * 1000.0 } else { n };
            from_millis(millis).map(Value::Date).unwrap_or(Value::Number(n))
        }
        Value::String(text) => match parse_date(&text) {
            Some(date) => Value::Date(date),
            None => Value::String(text),
        },
        other => other,
    }
}

fn from_millis(millis: f64) -> Option<DateTime<Utc>> {
    if !millis.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt(millis as i64).single()
}

/// Parse RFC 3339 text, or a plain `YYYY-MM-DD[ HH:MM:SS]` taken as UTC.
pub fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(text) {
        return Some(date.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn to_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => *n,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Null => 0.0,
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Date(d) => d.timestamp_millis() as f64,
        _ => return None,
    };
    (!n.is_nan()).then_some(n)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => *n != 0.0 && !n.is_nan(),
        Value::String(s) => !(s.is_empty() || s == "false" || s == "null" || s == "undefined"),
        _ => true,
    }
}

/// Coerce every element of a set to the kind of its first element.
fn write_set(items: Vec<Value>) -> Vec<Value> {
    match items.first() {
        Some(Value::String(_)) => items
            .into_iter()
            .map(|v| match v {
                Value::String(_) => v,
                other => Value::String(other.to_text().unwrap_or_default()),
            })
            .collect(),
        Some(Value::Number(_)) => items
            .into_iter()
            .map(|v| to_number(&v).map(Value::Number).unwrap_or(v))
            .collect(),
        Some(Value::Binary(_)) => items
            .into_iter()
            .map(|v| match v {
                Value::Binary(bytes) => Value::String(BASE64.encode(bytes)),
                other => other,
            })
            .collect(),
        _ => items,
    }
}

/// Apply member-wise coercions inside an object or array value.
fn write_nested(field: &Field, value: Value) -> Result<Value> {
    Ok(match value {
        Value::Object(map) => {
            let mut out = Properties::new();
            for (key, member) in map {
                if member.is_null() && !field.nulls {
                    continue;
                }
                out.insert(key, write_member(field, member)?);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|member| write_member(field, member))
                .collect::<Result<Vec<_>>>()?,
        ),
        other => other,
    })
}

fn write_member(field: &Field, member: Value) -> Result<Value> {
    Ok(match member {
        Value::Date(date) => encode_date(field, &date),
        Value::Binary(bytes) => Value::String(BASE64.encode(bytes)),
        Value::Array(items) if field.field_type == FieldType::Set => Value::Array(write_set(items)),
        nested @ (Value::Object(_) | Value::Array(_)) => write_nested(field, nested)?,
        other => other,
    })
}

fn write_condition(field: &Field, condition: Condition) -> Result<Condition> {
    let operand = match *condition.value {
        Value::Date(date) => encode_date(field, &date),
        Value::Array(bounds) => Value::Array(
            bounds
                .into_iter()
                .map(|b| match b {
                    Value::Date(date) => encode_date(field, &date),
                    other => other,
                })
                .collect(),
        ),
        other => other,
    };
    Ok(Condition::new(condition.op, operand))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, Block};
    use pretty_assertions::assert_eq;

    fn field(field_type: FieldType) -> Field {
        Field {
            name: "f".into(),
            pathname: "f".into(),
            field_type,
            attribute: Attribute {
                name: "f".into(),
                sub: None,
            },
            required: false,
            hidden: false,
            unique: false,
            nulls: false,
            default: None,
            generate: None,
            value: None,
            validate: None,
            enum_values: None,
            crypt: false,
            iso_dates: false,
            ttl: false,
            scope: None,
            is_indexed: false,
            block: None::<Block>,
        }
    }

    fn coercion() -> Coercion<'static> {
        Coercion {
            model: "M",
            transform: None,
            cipher: None,
        }
    }

    fn write(field: &Field, value: Value) -> Result<Value> {
        coercion().write(Op::Put, field, value, &Properties::new())
    }

    #[test]
    fn test_date_policies_round_trip() {
        let date = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap()
            + chrono::Duration::milliseconds(891);
        let c = coercion();

        let epoch = field(FieldType::Date);
        let stored = write(&epoch, Value::Date(date)).unwrap();
        assert_eq!(stored, Value::Number(date.timestamp_millis() as f64));
        assert_eq!(c.read(&epoch, stored, &Properties::new()).unwrap(), Value::Date(date));

        let mut iso = field(FieldType::Date);
        iso.iso_dates = true;
        let stored = write(&iso, Value::Date(date)).unwrap();
        assert_eq!(stored, Value::from("2026-03-04T05:06:07.891Z"));
        assert_eq!(c.read(&iso, stored, &Properties::new()).unwrap(), Value::Date(date));

        let mut ttl = field(FieldType::Date);
        ttl.ttl = true;
        let stored = write(&ttl, Value::Date(date)).unwrap();
        assert_eq!(stored, Value::Number((date.timestamp() + 1) as f64));
        match c.read(&ttl, stored, &Properties::new()).unwrap() {
            Value::Date(read) => assert_eq!(read.timestamp(), date.timestamp() + 1),
            other => panic!("expected date, got {other:?}"),
        }
    }

    #[test]
    fn test_date_from_string() {
        let f = field(FieldType::Date);
        let stored = write(&f, Value::from("2026-01-01T00:00:00Z")).unwrap();
        assert_eq!(stored, Value::Number(1_767_225_600_000.0));
        assert!(write(&f, Value::from("yesterday")).is_err());
    }

    #[test]
    fn test_number_coercion() {
        let f = field(FieldType::Number);
        assert_eq!(write(&f, Value::from("42")).unwrap(), Value::Number(42.0));
        let err = write(&f, Value::from("abc")).unwrap_err();
        assert_eq!(err.code(), "ValidationError");
    }

    #[test]
    fn test_boolean_coercion() {
        let f = field(FieldType::Boolean);
        assert_eq!(write(&f, Value::from("false")).unwrap(), Value::Bool(false));
        assert_eq!(write(&f, Value::from("undefined")).unwrap(), Value::Bool(false));
        assert_eq!(write(&f, Value::from("yes")).unwrap(), Value::Bool(true));
        assert_eq!(write(&f, Value::Number(0.0)).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_array_coercion() {
        let f = field(FieldType::Array);
        assert_eq!(write(&f, Value::from("")).unwrap(), Value::Array(vec![]));
        let err = write(&f, Value::from("x")).unwrap_err();
        assert_eq!(err.code(), "ArgumentError");
    }

    #[test]
    fn test_set_and_binary_coercion() {
        let f = field(FieldType::Set);
        assert_eq!(
            write(&f, Value::Array(vec![Value::from("a"), Value::Number(2.0)])).unwrap(),
            Value::Array(vec![Value::from("a"), Value::from("2")])
        );
        let b = field(FieldType::Binary);
        let stored = write(&b, Value::Binary(b"hi".to_vec())).unwrap();
        assert_eq!(stored, Value::from("aGk="));
        assert_eq!(
            coercion().read(&b, stored, &Properties::new()).unwrap(),
            Value::Binary(b"hi".to_vec())
        );
    }

    #[test]
    fn test_nested_object_drops_nulls() {
        let f = field(FieldType::Object);
        let date = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut obj = Properties::new();
        obj.insert("when".into(), Value::Date(date));
        obj.insert("gone".into(), Value::Null);
        let stored = write(&f, Value::Object(obj)).unwrap();
        let map = stored.as_object().unwrap();
        assert_eq!(map["when"], Value::Number(1_767_225_600_000.0));
        assert!(!map.contains_key("gone"));
    }

    #[test]
    fn test_crypt_without_cipher_fails() {
        let mut f = field(FieldType::String);
        f.crypt = true;
        let err = write(&f, Value::from("secret")).unwrap_err();
        assert_eq!(err.code(), "CryptError");
    }
}
