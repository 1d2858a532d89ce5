// ── Line protocol ──
//
// Points are built from the collector's records and rendered as InfluxDB
// line protocol: `measurement,tag=v field=1i,other="s" <ns timestamp>`.
// Tags and fields are kept sorted so output is stable.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

use serde_json::Value;

use kasa_core::{EmeterRecord, SysinfoRecord};

pub const EMETER_MEASUREMENT: &str = "emeter";
pub const SYSINFO_MEASUREMENT: &str = "sysinfo";

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "{n}i"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Str(s) => {
                f.write_char('"')?;
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        f.write_char('\\')?;
                    }
                    f.write_char(c)?;
                }
                f.write_char('"')
            }
        }
    }
}

/// One line-protocol point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp_ns: i64,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp_ns: i64) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp_ns,
        }
    }

    /// Add a tag. Empty values are skipped; InfluxDB rejects them.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.tags.insert(key.into(), value);
        }
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// A point without fields cannot be written.
    pub fn is_writable(&self) -> bool {
        !self.fields.is_empty()
    }

    /// One emeter point: one integer field per metric, outlet tags for
    /// strip children.
    pub fn from_emeter(record: &EmeterRecord, timestamp_ns: i64) -> Self {
        let mut point = Self::new(EMETER_MEASUREMENT, timestamp_ns)
            .tag("ip", &record.ip)
            .tag("dns_name", &record.dns_name)
            .tag("device_alias", &record.device_alias)
            .tag("equipment_type", record.equipment_type.to_string());
        if let Some(alias) = &record.plug_alias {
            point = point.tag("plug_alias", alias);
        }
        if let Some(index) = record.plug_index {
            point = point.tag("plug_index", index.to_string());
        }
        for (metric, value) in &record.emeter {
            point = point.field(metric, FieldValue::Integer(*value));
        }
        point
    }

    /// One sysinfo point. Nested objects flatten to dotted keys; lists of
    /// scalars become comma-joined strings.
    pub fn from_sysinfo(record: &SysinfoRecord, timestamp_ns: i64) -> Self {
        let mut point = Self::new(SYSINFO_MEASUREMENT, timestamp_ns)
            .tag("ip", &record.ip)
            .tag("dns_name", &record.dns_name)
            .tag("device_alias", &record.device_alias)
            .tag("equipment_type", record.equipment_type.to_string());
        for (key, value) in &record.sysinfo {
            flatten(key, value, &mut point.fields);
        }
        point
    }

    /// Render as a single line, without the trailing newline.
    pub fn to_line(&self) -> String {
        let mut line = String::new();
        push_escaped(&mut line, &self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            line.push(',');
            push_escaped(&mut line, key, KEY_SPECIALS);
            line.push('=');
            push_escaped(&mut line, value, KEY_SPECIALS);
        }
        for (i, (key, value)) in self.fields.iter().enumerate() {
            line.push(if i == 0 { ' ' } else { ',' });
            push_escaped(&mut line, key, KEY_SPECIALS);
            let _ = write!(line, "={value}");
        }
        let _ = write!(line, " {}", self.timestamp_ns);
        line
    }
}

const KEY_SPECIALS: &[char] = &[',', '=', ' '];

fn push_escaped(out: &mut String, raw: &str, specials: &[char]) {
    for c in raw.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            c if specials.contains(&c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
}

fn flatten(key: &str, value: &Value, fields: &mut BTreeMap<String, FieldValue>) {
    match value {
        Value::Null => {}
        Value::Bool(b) => {
            fields.insert(key.to_owned(), FieldValue::Bool(*b));
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                fields.insert(key.to_owned(), FieldValue::Integer(i));
            } else if let Some(x) = n.as_f64().filter(|x| x.is_finite()) {
                fields.insert(key.to_owned(), FieldValue::Float(x));
            }
        }
        Value::String(s) => {
            fields.insert(key.to_owned(), FieldValue::Str(s.clone()));
        }
        Value::Array(items) if items.is_empty() => {}
        Value::Array(items) if items.iter().all(is_scalar) => {
            let joined = items.iter().map(scalar_text).collect::<Vec<_>>().join(",");
            fields.insert(key.to_owned(), FieldValue::Str(joined));
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten(&format!("{key}.{i}"), item, fields);
            }
        }
        Value::Object(map) => {
            for (sub, item) in map {
                flatten(&format!("{key}.{sub}"), item, fields);
            }
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
