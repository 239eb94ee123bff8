//! # Sampler
//!
//! Single-threaded preview pipeline: reads a bounded number of rows from an
//! input source, applies timestamp extraction, transforms, filtering and
//! optional rollup, and reports both raw and parsed forms per row. Rows
//! that fail any stage degrade to unparseable entries instead of aborting
//! the sample; per-row errors ride along in the response.

use crate::errors::CoordError;
use crate::granularity::Granularity;
use crate::model::DataSource;
use crate::temporal::{parse_instant, Instant};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::debug;

/// Hard cap on sampled rows, independent of configuration.
pub const MAX_SAMPLER_ROWS: usize = 5_000;

const DEFAULT_SAMPLER_ROWS: usize = 200;
const DEFAULT_SAMPLER_MAX_BYTES: usize = 10 * 1024 * 1024;

/// Source of raw rows. Opening yields a scoped reader that is released on
/// every exit path, including configuration errors and early termination,
/// by being dropped.
pub trait InputSource {
    fn open<'a>(&'a self) -> Result<Box<dyn Iterator<Item = String> + 'a>, CoordError>;
}

/// Rows held inline in memory, one per non-empty line.
pub struct InlineInputSource {
    data: String,
}

impl InlineInputSource {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }
}

impl InputSource for InlineInputSource {
    fn open<'a>(&'a self) -> Result<Box<dyn Iterator<Item = String> + 'a>, CoordError> {
        Ok(Box::new(
            self.data
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string),
        ))
    }
}

/// How raw rows decode into flat field maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum InputFormat {
    Json,
    Tsv {
        #[serde(default = "default_delimiter")]
        delimiter: char,
        columns: Vec<String>,
    },
}

fn default_delimiter() -> char {
    '\t'
}

impl InputFormat {
    fn parse(&self, raw: &str) -> Result<JsonMap<String, Value>, String> {
        match self {
            InputFormat::Json => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => Ok(map),
                _ => Err(format!("Unable to parse row [{raw}]")),
            },
            InputFormat::Tsv { delimiter, columns } => {
                let mut map = JsonMap::new();
                for (column, field) in columns.iter().zip(raw.split(*delimiter)) {
                    map.insert(column.clone(), Value::String(field.to_string()));
                }
                if map.is_empty() {
                    return Err(format!("Unable to parse row [{raw}]"));
                }
                Ok(map)
            }
        }
    }
}

/// Accepted timestamp renditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampFormat {
    #[default]
    Auto,
    Iso,
    Millis,
    Posix,
}

/// Where and how to read the primary timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimestampSpec {
    #[serde(default = "default_timestamp_column")]
    pub column: String,
    #[serde(default)]
    pub format: TimestampFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_value: Option<Instant>,
}

fn default_timestamp_column() -> String {
    "timestamp".to_string()
}

impl Default for TimestampSpec {
    fn default() -> Self {
        Self {
            column: default_timestamp_column(),
            format: TimestampFormat::Auto,
            missing_value: None,
        }
    }
}

const DATE_ONLY_FORMAT: &[time::format_description::FormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

impl TimestampSpec {
    fn parse(&self, row: &JsonMap<String, Value>) -> Result<Instant, ()> {
        let value = match row.get(&self.column) {
            None | Some(Value::Null) => return self.missing_value.ok_or(()),
            Some(value) => value,
        };
        match (self.format, value) {
            (TimestampFormat::Millis, Value::Number(n)) => n.as_i64().ok_or(()),
            (TimestampFormat::Millis, Value::String(s)) => s.trim().parse().map_err(|_| ()),
            (TimestampFormat::Posix, Value::Number(n)) => {
                n.as_i64().map(|s| s * 1_000).ok_or(())
            }
            (TimestampFormat::Posix, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(|seconds| seconds * 1_000)
                .map_err(|_| ()),
            (TimestampFormat::Iso, Value::String(s)) => parse_iso_instant(s).ok_or(()),
            (TimestampFormat::Auto, Value::Number(n)) => n.as_i64().ok_or(()),
            (TimestampFormat::Auto, Value::String(s)) => parse_iso_instant(s)
                .or_else(|| s.trim().parse().ok())
                .ok_or(()),
            _ => Err(()),
        }
    }
}

fn parse_iso_instant(value: &str) -> Option<Instant> {
    let value = value.trim();
    if let Ok(dt) = OffsetDateTime::parse(value, &Rfc3339) {
        return Some((dt.unix_timestamp_nanos() / 1_000_000) as Instant);
    }
    if let Some(instant) = parse_instant(value) {
        return Some(instant);
    }
    time::Date::parse(value, DATE_ONLY_FORMAT)
        .ok()
        .map(|date| date.midnight().assume_utc().unix_timestamp() * 1_000)
}

/// Which fields become dimensions. An empty list discovers every field
/// except the timestamp column and aggregator inputs and outputs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionsSpec {
    #[serde(default)]
    pub dimensions: Vec<String>,
}

/// A named derived field, evaluated before dimension selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    pub name: String,
    pub expression: String,
}

/// Row filter applied after transforms. Rows a filter rejects are absent
/// from the sample and from both row counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RowFilter {
    Selector { dimension: String, value: String },
}

impl RowFilter {
    fn matches(&self, row: &JsonMap<String, Value>) -> bool {
        match self {
            RowFilter::Selector { dimension, value } => match row.get(dimension) {
                Some(Value::String(s)) => s == value,
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| matches!(item, Value::String(s) if s == value)),
                Some(Value::Number(n)) => n.to_string() == *value,
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformSpec {
    #[serde(default)]
    pub transforms: Vec<Transform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<RowFilter>,
}

/// Rollup aggregators; inputs that cannot be coerced to numbers degrade
/// the row to unparseable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AggregatorSpec {
    Count { name: String },
    LongSum { name: String, field_name: String },
}

impl AggregatorSpec {
    fn name(&self) -> &str {
        match self {
            AggregatorSpec::Count { name } | AggregatorSpec::LongSum { name, .. } => name,
        }
    }

    fn field_name(&self) -> Option<&str> {
        match self {
            AggregatorSpec::Count { .. } => None,
            AggregatorSpec::LongSum { field_name, .. } => Some(field_name),
        }
    }

    fn increment(&self, row: &JsonMap<String, Value>) -> Result<i64, String> {
        match self {
            AggregatorSpec::Count { .. } => Ok(1),
            AggregatorSpec::LongSum { field_name, .. } => match row.get(field_name) {
                None | Some(Value::Null) => Ok(0),
                Some(Value::Number(n)) => n
                    .as_i64()
                    .ok_or_else(|| format!("could not aggregate [{field_name}]: not a long")),
                Some(Value::String(s)) => s.trim().parse().map_err(|_| {
                    format!("could not aggregate [{field_name}]: [{s}] is not a long")
                }),
                Some(other) => Err(format!(
                    "could not aggregate [{field_name}]: unexpected value {other}"
                )),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GranularitySpec {
    #[serde(default = "default_segment_granularity")]
    pub segment_granularity: Granularity,
    #[serde(default = "default_query_granularity")]
    pub query_granularity: Granularity,
    #[serde(default = "default_rollup")]
    pub rollup: bool,
}

fn default_segment_granularity() -> Granularity {
    Granularity::Day
}

fn default_query_granularity() -> Granularity {
    Granularity::None
}

fn default_rollup() -> bool {
    true
}

impl Default for GranularitySpec {
    fn default() -> Self {
        Self {
            segment_granularity: default_segment_granularity(),
            query_granularity: default_query_granularity(),
            rollup: default_rollup(),
        }
    }
}

/// Everything the sampler needs to know about the target schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSchema {
    pub data_source: DataSource,
    pub timestamp_spec: TimestampSpec,
    #[serde(default)]
    pub dimensions_spec: DimensionsSpec,
    #[serde(default)]
    pub transform_spec: TransformSpec,
    #[serde(default)]
    pub aggregators: Vec<AggregatorSpec>,
    #[serde(default)]
    pub granularity_spec: GranularitySpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SamplerConfig {
    pub num_rows: usize,
    /// Budget on raw input bytes held for the sample; reading stops once
    /// it is spent, whatever `num_rows` still allows.
    pub max_bytes_in_memory: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_rows: DEFAULT_SAMPLER_ROWS,
            max_bytes_in_memory: DEFAULT_SAMPLER_MAX_BYTES,
        }
    }
}

/// One sampled row: the raw input, the parsed form when indexable, and an
/// error message when not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplerResponseRow {
    pub raw: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed: Option<JsonMap<String, Value>>,
    pub unparseable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplerResponse {
    pub num_rows_read: usize,
    pub num_rows_indexed: usize,
    pub data: Vec<SamplerResponseRow>,
}

/// Slot in the response: either a degraded row, or an index into the
/// rollup groups so merged rows keep their first-appearance position.
enum RowSlot {
    Unparseable(SamplerResponseRow),
    Group(usize),
}

struct GroupState {
    raw: String,
    time: Instant,
    dimensions: Vec<(String, Value)>,
    aggregates: Vec<i64>,
}

pub struct Sampler;

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler {
    pub fn new() -> Self {
        Self
    }

    pub fn sample(
        &self,
        input_source: &dyn InputSource,
        input_format: &InputFormat,
        data_schema: Option<&DataSchema>,
        config: &SamplerConfig,
    ) -> Result<SamplerResponse, CoordError> {
        let max_rows = config.num_rows.clamp(1, MAX_SAMPLER_ROWS);
        let max_bytes = config.max_bytes_in_memory.max(1);
        let reader = input_source.open()?;

        let mut num_rows_read = 0usize;
        let mut num_rows_indexed = 0usize;
        let mut bytes_read = 0usize;
        let mut slots: Vec<RowSlot> = Vec::new();
        let mut groups: Vec<GroupState> = Vec::new();
        let mut group_index: FxHashMap<String, usize> = FxHashMap::default();

        for raw in reader {
            if num_rows_read >= max_rows || bytes_read >= max_bytes {
                break;
            }
            bytes_read += raw.len();

            let Some(schema) = data_schema else {
                num_rows_read += 1;
                slots.push(RowSlot::Unparseable(unparseable_row(
                    raw.clone(),
                    format!("Unparseable timestamp found! Event: {raw}"),
                )));
                continue;
            };

            let mut row = match input_format.parse(&raw) {
                Ok(row) => row,
                Err(message) => {
                    num_rows_read += 1;
                    slots.push(RowSlot::Unparseable(unparseable_row(raw, message)));
                    continue;
                }
            };

            let mut transform_error = None;
            for transform in &schema.transform_spec.transforms {
                match eval_expression(&transform.expression, &row) {
                    Ok(value) => {
                        row.insert(transform.name.clone(), value);
                    }
                    Err(message) => {
                        transform_error = Some(message);
                        break;
                    }
                }
            }
            if let Some(message) = transform_error {
                num_rows_read += 1;
                slots.push(RowSlot::Unparseable(unparseable_row(
                    raw,
                    format!("could not transform value: {message}"),
                )));
                continue;
            }

            // Filtered rows vanish without touching either counter.
            if let Some(filter) = &schema.transform_spec.filter {
                if !filter.matches(&row) {
                    continue;
                }
            }

            let Ok(timestamp) = schema.timestamp_spec.parse(&row) else {
                num_rows_read += 1;
                slots.push(RowSlot::Unparseable(unparseable_row(
                    raw.clone(),
                    format!("Unparseable timestamp found! Event: {raw}"),
                )));
                continue;
            };
            num_rows_read += 1;

            let dimensions = select_dimensions(schema, &row);
            let truncated = schema
                .granularity_spec
                .query_granularity
                .truncate(timestamp);

            let mut aggregates = Vec::with_capacity(schema.aggregators.len());
            let mut aggregate_error = None;
            for aggregator in &schema.aggregators {
                match aggregator.increment(&row) {
                    Ok(delta) => aggregates.push(delta),
                    Err(message) => {
                        aggregate_error = Some(message);
                        break;
                    }
                }
            }
            if let Some(message) = aggregate_error {
                slots.push(RowSlot::Unparseable(unparseable_row(raw, message)));
                continue;
            }

            if schema.granularity_spec.rollup {
                let key = rollup_key(truncated, &dimensions);
                match group_index.get(&key) {
                    Some(&idx) => {
                        for (slot, delta) in groups[idx].aggregates.iter_mut().zip(&aggregates) {
                            *slot += delta;
                        }
                    }
                    None => {
                        let idx = groups.len();
                        groups.push(GroupState {
                            raw,
                            time: truncated,
                            dimensions,
                            aggregates,
                        });
                        group_index.insert(key, idx);
                        slots.push(RowSlot::Group(idx));
                    }
                }
            } else {
                let idx = groups.len();
                groups.push(GroupState {
                    raw,
                    time: truncated,
                    dimensions,
                    aggregates,
                });
                slots.push(RowSlot::Group(idx));
            }
            num_rows_indexed += 1;
        }

        let data = slots
            .into_iter()
            .map(|slot| match slot {
                RowSlot::Unparseable(row) => row,
                RowSlot::Group(idx) => {
                    let group = &groups[idx];
                    let mut parsed = JsonMap::new();
                    parsed.insert("__time".to_string(), Value::from(group.time));
                    for (name, value) in &group.dimensions {
                        parsed.insert(name.clone(), value.clone());
                    }
                    let aggregators = data_schema.map(|s| s.aggregators.as_slice()).unwrap_or(&[]);
                    for (aggregator, value) in aggregators.iter().zip(&group.aggregates) {
                        parsed.insert(aggregator.name().to_string(), Value::from(*value));
                    }
                    SamplerResponseRow {
                        raw: group.raw.clone(),
                        parsed: Some(parsed),
                        unparseable: false,
                        error: None,
                    }
                }
            })
            .collect();

        debug!(
            rows_read = num_rows_read,
            rows_indexed = num_rows_indexed,
            "sample complete"
        );
        Ok(SamplerResponse {
            num_rows_read,
            num_rows_indexed,
            data,
        })
    }
}

fn unparseable_row(raw: String, error: String) -> SamplerResponseRow {
    SamplerResponseRow {
        raw,
        parsed: None,
        unparseable: true,
        error: Some(error),
    }
}

fn select_dimensions(schema: &DataSchema, row: &JsonMap<String, Value>) -> Vec<(String, Value)> {
    if schema.dimensions_spec.dimensions.is_empty() {
        // Schema discovery: everything except the timestamp column and
        // aggregator inputs/outputs, in the map's (sorted) order.
        row.iter()
            .filter(|(name, _)| {
                *name != &schema.timestamp_spec.column
                    && !schema.aggregators.iter().any(|agg| {
                        agg.name() == name.as_str() || agg.field_name() == Some(name.as_str())
                    })
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    } else {
        schema
            .dimensions_spec
            .dimensions
            .iter()
            .filter_map(|name| row.get(name).map(|value| (name.clone(), value.clone())))
            .collect()
    }
}

fn rollup_key(time: Instant, dimensions: &[(String, Value)]) -> String {
    let mut key = time.to_string();
    for (name, value) in dimensions {
        key.push('\u{0}');
        key.push_str(name);
        key.push('\u{0}');
        key.push_str(&value.to_string());
    }
    key
}

// ---- transform expressions ----
//
// A deliberately small language: identifiers, single-quoted string
// literals, integer literals, `concat(...)`, and `+` over longs. Type
// errors surface as row-level failures, never panics.

fn eval_expression(expression: &str, row: &JsonMap<String, Value>) -> Result<Value, String> {
    let mut parser = ExprParser {
        bytes: expression.as_bytes(),
        pos: 0,
    };
    let value = parser.parse_additive(row)?;
    parser.skip_whitespace();
    if parser.pos != parser.bytes.len() {
        return Err(format!("unexpected trailing input in [{expression}]"));
    }
    Ok(value)
}

struct ExprParser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ExprParser<'a> {
    fn skip_whitespace(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn parse_additive(&mut self, row: &JsonMap<String, Value>) -> Result<Value, String> {
        let mut value = self.parse_primary(row)?;
        loop {
            self.skip_whitespace();
            if self.peek() == Some(b'+') {
                self.pos += 1;
                let rhs = self.parse_primary(row)?;
                value = Value::from(as_long(&value)? + as_long(&rhs)?);
            } else {
                return Ok(value);
            }
        }
    }

    fn parse_primary(&mut self, row: &JsonMap<String, Value>) -> Result<Value, String> {
        self.skip_whitespace();
        match self.peek() {
            Some(b'\'') => self.parse_string_literal(),
            Some(c) if c.is_ascii_digit() || c == b'-' => self.parse_integer(),
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => {
                let ident = self.parse_identifier();
                self.skip_whitespace();
                if self.peek() == Some(b'(') {
                    self.parse_call(&ident, row)
                } else {
                    Ok(row.get(&ident).cloned().unwrap_or(Value::Null))
                }
            }
            _ => Err("expected identifier, literal, or function call".to_string()),
        }
    }

    fn parse_string_literal(&mut self) -> Result<Value, String> {
        self.pos += 1;
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\'' {
            self.pos += 1;
        }
        if self.pos == self.bytes.len() {
            return Err("unterminated string literal".to_string());
        }
        let literal = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| "invalid utf-8 in literal".to_string())?
            .to_string();
        self.pos += 1;
        Ok(Value::String(literal))
    }

    fn parse_integer(&mut self) -> Result<Value, String> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("");
        text.parse::<i64>()
            .map(Value::from)
            .map_err(|_| format!("invalid integer literal [{text}]"))
    }

    fn parse_identifier(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
        {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned()
    }

    fn parse_call(&mut self, name: &str, row: &JsonMap<String, Value>) -> Result<Value, String> {
        self.pos += 1; // consume '('
        let mut args = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() == Some(b')') {
                self.pos += 1;
                break;
            }
            args.push(self.parse_additive(row)?);
            self.skip_whitespace();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b')') => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(format!("malformed argument list for [{name}]")),
            }
        }
        match name {
            "concat" => Ok(Value::String(
                args.iter().map(stringify).collect::<Vec<_>>().concat(),
            )),
            other => Err(format!("unknown function [{other}]")),
        }
    }
}

fn as_long(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| format!("[{n}] is not a long")),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| format!("[{s}] is not a long")),
        other => Err(format!("cannot treat {other} as a long")),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROWS: &str = r#"{"t":"2019-04-22T12:00","dim1":"foo","met1":1}
{"t":"2019-04-22T12:00","dim1":"foo","met1":2}
{"t":"2019-04-22T12:01","dim1":"foo","met1":3}
{"t":"2019-04-22T12:00","dim1":"foo2","met1":4}
{"t":"2019-04-22T12:00","dim1":"foo","dim2":"bar","met1":5}
{"t":"bad_timestamp","dim1":"foo","met1":6}"#;

    fn rows_with_iso() -> String {
        // The fixture timestamps lack seconds and offsets; rewrite them into
        // full ISO instants the auto parser accepts.
        ROWS.replace("2019-04-22T12:00", "2019-04-22T12:00:00Z")
            .replace("2019-04-22T12:01", "2019-04-22T12:01:00Z")
    }

    fn schema(rollup: bool, dimensions: Vec<&str>, aggregators: Vec<AggregatorSpec>) -> DataSchema {
        DataSchema {
            data_source: DataSource::from("sampled"),
            timestamp_spec: TimestampSpec {
                column: "t".to_string(),
                format: TimestampFormat::Auto,
                missing_value: None,
            },
            dimensions_spec: DimensionsSpec {
                dimensions: dimensions.into_iter().map(str::to_string).collect(),
            },
            transform_spec: TransformSpec::default(),
            aggregators,
            granularity_spec: GranularitySpec {
                segment_granularity: Granularity::Day,
                query_granularity: Granularity::Hour,
                rollup,
            },
        }
    }

    fn ts_2019_04_22_12() -> Instant {
        crate::temporal::instant_from_datetime(time::macros::datetime!(2019-04-22 12:00:00 UTC))
    }

    #[test]
    fn test_no_data_schema_reports_all_rows_unparseable() {
        let source = InlineInputSource::new(rows_with_iso());
        let response = Sampler::new()
            .sample(&source, &InputFormat::Json, None, &SamplerConfig::default())
            .unwrap();

        assert_eq!(response.num_rows_read, 6);
        assert_eq!(response.num_rows_indexed, 0);
        assert_eq!(response.data.len(), 6);
        for row in &response.data {
            assert!(row.unparseable);
            assert!(row.parsed.is_none());
            assert!(row.error.as_deref().unwrap().contains("Unparseable timestamp"));
        }
    }

    #[test]
    fn test_no_data_schema_respects_row_budget() {
        let source = InlineInputSource::new(rows_with_iso());
        let response = Sampler::new()
            .sample(
                &source,
                &InputFormat::Json,
                None,
                &SamplerConfig {
                    num_rows: 3,
                    ..SamplerConfig::default()
                },
            )
            .unwrap();
        assert_eq!(response.num_rows_read, 3);
        assert_eq!(response.data.len(), 3);
    }

    #[test]
    fn test_byte_budget_stops_reading() {
        let source = InlineInputSource::new(rows_with_iso());
        let first_row_len = rows_with_iso().lines().next().unwrap().len();
        let response = Sampler::new()
            .sample(
                &source,
                &InputFormat::Json,
                Some(&schema(false, vec!["dim1"], vec![])),
                &SamplerConfig {
                    num_rows: 200,
                    max_bytes_in_memory: first_row_len,
                },
            )
            .unwrap();

        // The first row spends the whole budget; the second never reads.
        assert_eq!(response.num_rows_read, 1);
        assert_eq!(response.data.len(), 1);
        assert!(!response.data[0].unparseable);
    }

    #[test]
    fn test_unparseable_timestamp_degrades_row() {
        let source = InlineInputSource::new(rows_with_iso());
        let response = Sampler::new()
            .sample(
                &source,
                &InputFormat::Json,
                Some(&schema(false, vec!["dim1"], vec![])),
                &SamplerConfig::default(),
            )
            .unwrap();

        assert_eq!(response.num_rows_read, 6);
        assert_eq!(response.num_rows_indexed, 5);
        let last = response.data.last().unwrap();
        assert!(last.unparseable);
        assert!(last.error.as_deref().unwrap().contains("bad_timestamp"));
    }

    #[test]
    fn test_no_rollup_emits_one_row_per_input() {
        let source = InlineInputSource::new(rows_with_iso());
        let response = Sampler::new()
            .sample(
                &source,
                &InputFormat::Json,
                Some(&schema(false, vec!["dim1"], vec![])),
                &SamplerConfig::default(),
            )
            .unwrap();

        let parsed_rows: Vec<_> = response.data.iter().filter(|r| !r.unparseable).collect();
        assert_eq!(parsed_rows.len(), 5);
        let first = parsed_rows[0].parsed.as_ref().unwrap();
        assert_eq!(first["__time"], Value::from(ts_2019_04_22_12()));
        assert_eq!(first["dim1"], Value::from("foo"));
    }

    #[test]
    fn test_rollup_combines_matching_rows() {
        let aggregators = vec![AggregatorSpec::LongSum {
            name: "met1".to_string(),
            field_name: "met1".to_string(),
        }];
        let source = InlineInputSource::new(rows_with_iso());
        let response = Sampler::new()
            .sample(
                &source,
                &InputFormat::Json,
                Some(&schema(true, vec!["dim1"], aggregators)),
                &SamplerConfig::default(),
            )
            .unwrap();

        assert_eq!(response.num_rows_read, 6);
        assert_eq!(response.num_rows_indexed, 5);
        // Hour-truncation folds 12:01 into the 12:00 bucket, so the groups
        // are (12:00, foo) and (12:00, foo2); the unparseable row is
        // retained one-per-input.
        let indexed: Vec<_> = response.data.iter().filter(|r| !r.unparseable).collect();
        assert_eq!(indexed.len(), 2);
        let first = indexed[0].parsed.as_ref().unwrap();
        assert_eq!(first["met1"], Value::from(11));
        assert_eq!(indexed[1].parsed.as_ref().unwrap()["met1"], Value::from(4));
        assert_eq!(response.data.iter().filter(|r| r.unparseable).count(), 1);
    }

    #[test]
    fn test_rollup_with_more_dimensions_splits_groups() {
        let aggregators = vec![AggregatorSpec::LongSum {
            name: "met1".to_string(),
            field_name: "met1".to_string(),
        }];
        let source = InlineInputSource::new(rows_with_iso());
        let response = Sampler::new()
            .sample(
                &source,
                &InputFormat::Json,
                Some(&schema(true, vec!["dim1", "dim2"], aggregators)),
                &SamplerConfig::default(),
            )
            .unwrap();

        let indexed: Vec<_> = response.data.iter().filter(|r| !r.unparseable).collect();
        // (foo), (foo2), and (foo, bar) — the extra dimension splits the
        // group that plain dim1 rollup would have merged.
        assert_eq!(indexed.len(), 3);
    }

    #[test]
    fn test_transform_applies_before_dimension_selection() {
        let mut data_schema = schema(false, vec!["dim1PlusBar"], vec![]);
        data_schema.transform_spec.transforms.push(Transform {
            name: "dim1PlusBar".to_string(),
            expression: "concat(dim1, 'bar')".to_string(),
        });

        let source = InlineInputSource::new(rows_with_iso());
        let response = Sampler::new()
            .sample(
                &source,
                &InputFormat::Json,
                Some(&data_schema),
                &SamplerConfig::default(),
            )
            .unwrap();

        let first = response.data[0].parsed.as_ref().unwrap();
        assert_eq!(first["dim1PlusBar"], Value::from("foobar"));
    }

    #[test]
    fn test_failed_transform_degrades_row_but_counts_read() {
        let mut data_schema = schema(false, vec!["dim1"], vec![]);
        data_schema.transform_spec.transforms.push(Transform {
            name: "broken".to_string(),
            expression: "dim1 + 1".to_string(),
        });

        let source = InlineInputSource::new(rows_with_iso());
        let response = Sampler::new()
            .sample(
                &source,
                &InputFormat::Json,
                Some(&data_schema),
                &SamplerConfig::default(),
            )
            .unwrap();

        assert_eq!(response.num_rows_read, 6);
        assert_eq!(response.num_rows_indexed, 0);
        assert!(response.data.iter().all(|r| r.unparseable));
        assert!(response.data[0]
            .error
            .as_deref()
            .unwrap()
            .contains("could not transform value"));
    }

    #[test]
    fn test_filtered_rows_are_not_counted() {
        let mut data_schema = schema(false, vec!["dim1"], vec![]);
        data_schema.transform_spec.filter = Some(RowFilter::Selector {
            dimension: "dim1".to_string(),
            value: "foo".to_string(),
        });

        let source = InlineInputSource::new(rows_with_iso());
        let response = Sampler::new()
            .sample(
                &source,
                &InputFormat::Json,
                Some(&data_schema),
                &SamplerConfig::default(),
            )
            .unwrap();

        // foo2 is dropped silently; the bad-timestamp foo row still reads.
        assert_eq!(response.num_rows_read, 5);
        assert_eq!(response.num_rows_indexed, 4);
    }

    #[test]
    fn test_tsv_format() {
        let source = InlineInputSource::new("2019-04-22T12:00:00Z\tfoo\n2019-04-22T12:00:00Z\tbar");
        let format = InputFormat::Tsv {
            delimiter: '\t',
            columns: vec!["t".to_string(), "dim1".to_string()],
        };
        let response = Sampler::new()
            .sample(
                &source,
                &format,
                Some(&schema(false, vec!["dim1"], vec![])),
                &SamplerConfig::default(),
            )
            .unwrap();
        assert_eq!(response.num_rows_indexed, 2);
        assert_eq!(
            response.data[1].parsed.as_ref().unwrap()["dim1"],
            Value::from("bar")
        );
    }

    #[test]
    fn test_numeric_sum_expression() {
        let row: JsonMap<String, Value> =
            serde_json::from_str(r#"{"met1": 3, "met2": "4"}"#).unwrap();
        assert_eq!(
            eval_expression("met1 + met2 + 10", &row).unwrap(),
            Value::from(17)
        );
        assert!(eval_expression("met1 +", &row).is_err());
        assert!(eval_expression("unknown_fn(met1)", &row).is_err());
    }

    #[test]
    fn test_missing_value_timestamp_spec() {
        let mut data_schema = schema(false, vec!["dim1"], vec![]);
        data_schema.timestamp_spec = TimestampSpec {
            column: "absent".to_string(),
            format: TimestampFormat::Auto,
            missing_value: Some(ts_2019_04_22_12()),
        };
        let source = InlineInputSource::new(rows_with_iso());
        let response = Sampler::new()
            .sample(
                &source,
                &InputFormat::Json,
                Some(&data_schema),
                &SamplerConfig::default(),
            )
            .unwrap();
        assert_eq!(response.num_rows_indexed, 6);
        let first = response.data[0].parsed.as_ref().unwrap();
        assert_eq!(first["__time"], Value::from(ts_2019_04_22_12()));
    }
}
