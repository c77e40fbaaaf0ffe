use chrono::NaiveDateTime;
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION_KEY: &str = "schema_version";
pub const CURRENT_SCHEMA_VERSION: i64 = 4;
pub const MIN_RELATIONAL_SCHEMA_VERSION: i64 = 2;
pub const DEFAULT_CLIENT_ID: i64 = 1;
pub const DEFAULT_PROJECT_ID: i64 = 1;
pub const DEFAULT_CLIENT_NAME: &str = "Default Client";
pub const DEFAULT_PROJECT_NAME: &str = "Default";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single SQL value as read from or bound to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Real(value) => Some(*value as i64),
            Self::Text(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(value) => Some(*value as f64),
            Self::Real(value) => Some(*value),
            Self::Text(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Text rendering of any non-null value. Whole reals render without a
    /// fraction so `4.0` reads back as `4`.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Integer(value) => Some(value.to_string()),
            Self::Real(value) if value.is_finite() && value.fract() == 0.0 => Some(format!("{:.0}", value)),
            Self::Real(value) => Some(value.to_string()),
            Self::Text(value) => Some(value.clone()),
            Self::Blob(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        }
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(value) => Self::Integer(value),
            ValueRef::Real(value) => Self::Real(value),
            ValueRef::Text(bytes) => Self::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Self::Blob(bytes.to_vec()),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Integer(value) => ToSqlOutput::Owned(Value::Integer(*value)),
            Self::Real(value) => ToSqlOutput::Owned(Value::Real(*value)),
            Self::Text(value) => ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())),
            Self::Blob(value) => ToSqlOutput::Borrowed(ValueRef::Blob(value)),
        })
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Builds a `Vec<SqlValue>` from heterogeneous positional parameters.
#[macro_export]
macro_rules! sql_params {
    () => {
        ::std::vec::Vec::<$crate::models::SqlValue>::new()
    };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::models::SqlValue::from($value)),+]
    };
}

/// One result row, columns kept in statement order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Row {
    columns: Vec<(String, SqlValue)>,
}

impl Row {
    pub fn new(columns: Vec<(String, SqlValue)>) -> Self {
        Self { columns }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(SqlValue::as_i64)
    }

    pub fn f64(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(SqlValue::as_f64)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(SqlValue::as_str)
    }

    /// Non-empty trimmed text, `None` for NULL or blank.
    pub fn non_empty_text(&self, column: &str) -> Option<String> {
        self.text(column)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchemaShape {
    Legacy,
    Current,
}

impl SchemaShape {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Current => "current",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IconColorMode {
    #[default]
    Auto,
    Light,
    Dark,
}

impl IconColorMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Light => "light",
            Self::Dark => "dark",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "light" => Self::Light,
            "dark" => Self::Dark,
            _ => Self::Auto,
        }
    }
}

pub const DEFAULT_PROJECT_COLOR: &str = "#3584e4";
const LIGHT_ICON_COLOR: &str = "#ffffff";
const DARK_ICON_COLOR: &str = "#000000";

/// Icon color shown on top of a project color swatch.
///
/// `Auto` picks a dark icon for bright backgrounds (relative luminance
/// above 0.5) and a light icon otherwise. Unparseable colors fall back to
/// a light icon.
pub fn derive_icon_color(color: &str, mode: IconColorMode) -> String {
    match mode {
        IconColorMode::Light => LIGHT_ICON_COLOR.to_string(),
        IconColorMode::Dark => DARK_ICON_COLOR.to_string(),
        IconColorMode::Auto => match parse_hex_color(color) {
            Some((red, green, blue)) => {
                let luminance =
                    (0.2126 * f64::from(red) + 0.7152 * f64::from(green) + 0.0722 * f64::from(blue)) / 255.0;
                if luminance > 0.5 {
                    DARK_ICON_COLOR.to_string()
                } else {
                    LIGHT_ICON_COLOR.to_string()
                }
            }
            None => LIGHT_ICON_COLOR.to_string(),
        },
    }
}

fn parse_hex_color(raw: &str) -> Option<(u8, u8, u8)> {
    let hex = raw.trim().strip_prefix('#')?;
    let expanded: String = match hex.len() {
        3 => hex.chars().flat_map(|ch| [ch, ch]).collect(),
        6 => hex.to_string(),
        _ => return None,
    };
    let red = u8::from_str_radix(&expanded[0..2], 16).ok()?;
    let green = u8::from_str_radix(&expanded[2..4], 16).ok()?;
    let blue = u8::from_str_radix(&expanded[4..6], 16).ok()?;
    Some((red, green, blue))
}

/// Parses the naive timestamps stored in `time_entries`. Accepts the
/// canonical `YYYY-MM-DD HH:MM:SS` form, an ISO `T` separator and
/// fractional seconds.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
}

pub fn format_timestamp(value: NaiveDateTime) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

/// Progress callback payload for multi-step operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepProgress {
    pub step: usize,
    pub total_steps: usize,
    pub description: String,
}

pub type ProgressSink<'a> = &'a (dyn Fn(StepProgress) + Send + Sync);

pub(crate) fn report_progress(sink: Option<ProgressSink<'_>>, step: usize, total_steps: usize, description: &str) {
    tracing::debug!(step, total_steps, description, "step progress");
    if let Some(sink) = sink {
        sink(StepProgress {
            step,
            total_steps,
            description: description.to_string(),
        });
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub clients_added: usize,
    pub projects_added: usize,
    pub tasks_added: usize,
    pub instances_added: usize,
    pub entries_added: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub source_shape: Option<SchemaShape>,
    pub clients: usize,
    pub projects: usize,
    pub tasks: usize,
    pub task_instances: usize,
    pub time_entries: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub duplicate_active_closed: u64,
    pub invalid_intervals_collapsed: u64,
    pub durations_normalized: u64,
    pub totals_resynced: u64,
}

impl RepairReport {
    pub fn total_changes(&self) -> u64 {
        self.duplicate_active_closed
            + self.invalid_intervals_collapsed
            + self.durations_normalized
            + self.totals_resynced
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub name: String,
    pub kind: String,
    pub active: bool,
    pub connected: bool,
}

#[cfg(test)]
mod tests {
    use super::{derive_icon_color, parse_timestamp, IconColorMode, Row, SqlValue};

    #[test]
    fn auto_icon_color_follows_background_luminance() {
        assert_eq!(derive_icon_color("#ffff00", IconColorMode::Auto), "#000000");
        assert_eq!(derive_icon_color("#1c71d8", IconColorMode::Auto), "#ffffff");
        assert_eq!(derive_icon_color("#fff", IconColorMode::Auto), "#000000");
        assert_eq!(derive_icon_color("not-a-color", IconColorMode::Auto), "#ffffff");
    }

    #[test]
    fn explicit_icon_modes_ignore_color() {
        assert_eq!(derive_icon_color("#ffffff", IconColorMode::Light), "#ffffff");
        assert_eq!(derive_icon_color("#000000", IconColorMode::Dark), "#000000");
        assert_eq!(IconColorMode::parse("DARK"), IconColorMode::Dark);
        assert_eq!(IconColorMode::parse("weird"), IconColorMode::Auto);
    }

    #[test]
    fn parses_canonical_and_iso_timestamps() {
        let canonical = parse_timestamp("2024-01-01 10:00:00").expect("canonical");
        let iso = parse_timestamp("2024-01-01T10:00:00.250").expect("iso");
        assert_eq!(canonical.format("%H:%M:%S").to_string(), "10:00:00");
        assert_eq!(iso.format("%H:%M:%S").to_string(), "10:00:00");
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn row_accessors_coerce_values() {
        let row = Row::new(vec![
            ("id".to_string(), SqlValue::Integer(7)),
            ("rate".to_string(), SqlValue::Text("12.5".to_string())),
            ("name".to_string(), SqlValue::Text("  ".to_string())),
            ("end_time".to_string(), SqlValue::Null),
        ]);
        assert_eq!(row.i64("id"), Some(7));
        assert_eq!(row.f64("rate"), Some(12.5));
        assert_eq!(row.non_empty_text("name"), None);
        assert!(row.get("end_time").is_some_and(SqlValue::is_null));
        assert!(row.get("missing").is_none());
    }

    #[test]
    fn params_macro_accepts_mixed_types() {
        let params = crate::sql_params![1_i64, "name", None::<String>, 2.5_f64, true];
        assert_eq!(
            params,
            vec![
                SqlValue::Integer(1),
                SqlValue::Text("name".to_string()),
                SqlValue::Null,
                SqlValue::Real(2.5),
                SqlValue::Integer(1),
            ]
        );
    }
}
