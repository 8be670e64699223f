// Value template engine - parsing, dependency discovery, interpolation

use crate::error::{Result, SingleTableError};
use crate::value::{Condition, Properties, Value};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\$\{(.*?)\}").expect("placeholder pattern"))
}

/// A value template compiled once at schema-compile time.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub raw: String,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Variable {
        /// Dotted property path
        path: String,
        /// Left-pad the substituted text to this many characters
        width: Option<usize>,
        pad: String,
        /// The placeholder as written, kept for unresolved output
        source: String,
    },
}

/// Result of substituting properties into a template.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    /// Substituted text. Unresolved placeholders are left literally.
    pub text: String,
    /// Literal text up to the first unresolved placeholder
    pub prefix: String,
    pub unresolved: bool,
}

impl Template {
    pub fn parse(template: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut last = 0;

        for caps in placeholder().captures_iter(template) {
            let Some(whole) = caps.get(0) else { continue };
            if whole.start() > last {
                segments.push(Segment::Literal(template[last..whole.start()].to_string()));
            }
            let placeholder = &caps[1];
            let mut parts = placeholder.split(':');
            let path = parts.next().unwrap_or_default().trim().to_string();
            if path.is_empty() {
                return Err(SingleTableError::Schema(format!(
                    "Empty variable reference in template \"{template}\""
                )));
            }
            let width = match parts.next() {
                Some(w) if !w.is_empty() => Some(w.parse::<usize>().map_err(|_| {
                    SingleTableError::Schema(format!(
                        "Invalid width \"{w}\" in template \"{template}\""
                    ))
                })?),
                _ => None,
            };
            let pad = match parts.next() {
                Some(p) if !p.is_empty() => p.to_string(),
                _ => "0".to_string(),
            };
            segments.push(Segment::Variable {
                path,
                width,
                pad,
                source: whole.as_str().to_string(),
            });
            last = whole.end();
        }
        if last < template.len() {
            segments.push(Segment::Literal(template[last..].to_string()));
        }

        Ok(Template {
            raw: template.to_string(),
            segments,
        })
    }

    /// Property paths referenced by this template, in order of appearance.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Variable { path, .. } => Some(path.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Substitute property values. Dates are first encoded with `encode_date`
    /// so keys embed the same representation the field stores.
    pub fn render(
        &self,
        field: &str,
        properties: &Properties,
        encode_date: &dyn Fn(&DateTime<Utc>) -> Value,
    ) -> Result<Rendered> {
        let mut text = String::new();
        let mut prefix = String::new();
        let mut unresolved = false;

        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => {
                    text.push_str(s);
                    if !unresolved {
                        prefix.push_str(s);
                    }
                }
                Segment::Variable {
                    path,
                    width,
                    pad,
                    source,
                } => match lookup(properties, path) {
                    None | Some(Value::Null) => {
                        text.push_str(source);
                        unresolved = true;
                    }
                    Some(value) => {
                        let value = match value {
                            Value::Date(d) => encode_date(d),
                            other => other.clone(),
                        };
                        let mut s = value.to_text().ok_or_else(|| {
                            SingleTableError::Type(format!(
                                "Value for \"{field}\" is not a primitive value"
                            ))
                        })?;
                        if let Some(width) = width {
                            while s.chars().count() < *width {
                                s.insert_str(0, pad);
                            }
                        }
                        text.push_str(&s);
                        if !unresolved {
                            prefix.push_str(&s);
                        }
                    }
                },
            }
        }

        Ok(Rendered {
            text,
            prefix,
            unresolved,
        })
    }
}

impl Rendered {
    /// Apply the unresolved-variable policy. A fully resolved template yields
    /// its text. A partially resolved template yields nothing, unless it is
    /// the sort key of a range query, where the literal prefix becomes a
    /// begins-with condition.
    pub fn finish(self, range_prefix: bool) -> Option<Value> {
        if !self.unresolved {
            return Some(Value::String(self.text));
        }
        if range_prefix && !self.prefix.is_empty() {
            return Some(Value::Condition(Condition::begins(self.prefix)));
        }
        None
    }
}

fn lookup<'a>(properties: &'a Properties, path: &str) -> Option<&'a Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let value = properties.get(head)?;
    match rest {
        Some(rest) => value.get_path(rest),
        None => Some(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{to_properties, Operator};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn iso(d: &DateTime<Utc>) -> Value {
        Value::String(crate::value::iso_string(d))
    }

    #[test]
    fn test_parse_segments() {
        let t = Template::parse("${a}#${b:4:0}").unwrap();
        assert_eq!(t.segments.len(), 3);
        assert_eq!(t.variables().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(Template::parse("literal").unwrap().segments.len(), 1);
    }

    #[test]
    fn test_render_with_padding() {
        let t = Template::parse("${a}#${b:4:0}").unwrap();
        let props = to_properties(json!({"a": "X", "b": 7}));
        let rendered = t.render("sk", &props, &iso).unwrap();
        assert_eq!(rendered.text, "X#0007");
        assert_eq!(rendered.finish(false), Some(Value::from("X#0007")));
    }

    #[test]
    fn test_custom_pad_character() {
        let t = Template::parse("${n:5:_}").unwrap();
        let props = to_properties(json!({"n": 42}));
        assert_eq!(t.render("f", &props, &iso).unwrap().text, "___42");
    }

    #[test]
    fn test_unresolved_does_not_fire() {
        let t = Template::parse("${a}#${b:4:0}").unwrap();
        let props = to_properties(json!({"a": "X"}));
        let rendered = t.render("sk", &props, &iso).unwrap();
        assert!(rendered.unresolved);
        assert_eq!(rendered.text, "X#${b:4:0}");
        assert_eq!(rendered.clone().finish(false), None);
        assert_eq!(
            rendered.finish(true),
            Some(Value::Condition(Condition::new(Operator::Begins, "X#")))
        );
    }

    #[test]
    fn test_empty_prefix_yields_nothing() {
        let t = Template::parse("${a}#${b}").unwrap();
        let rendered = t.render("sk", &Properties::new(), &iso).unwrap();
        assert_eq!(rendered.finish(true), None);
    }

    #[test]
    fn test_nested_path_and_dates() {
        let t = Template::parse("${address.city}#${when}").unwrap();
        let mut props = to_properties(json!({"address": {"city": "NYC"}}));
        props.insert(
            "when".into(),
            Value::Date(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()),
        );
        let rendered = t.render("k", &props, &iso).unwrap();
        assert_eq!(rendered.text, "NYC#2026-01-02T03:04:05.000Z");
    }

    #[test]
    fn test_object_value_is_an_error() {
        let t = Template::parse("${obj}").unwrap();
        let props = to_properties(json!({"obj": {"x": 1}}));
        let err = t.render("k", &props, &iso).unwrap_err();
        assert_eq!(err.code(), "TypeError");
    }
}
