//! Column schema of export artifacts and the merged dataset, header
//! normalization, and per-field formatting rules.

use csv::StringRecord;

use crate::config::MergeConfig;

pub const FILENAME_COLUMN: &str = "filename";
pub const TEMPO_COLUMN: &str = "bpm";
pub const KEY_COLUMN: &str = "key";
pub const DANCEABILITY_COLUMN: &str = "danceability";

/// Spellings accepted for the filename column, in lookup priority order.
pub const FILENAME_ALIASES: [&str; 5] = ["filename", "file_name", "file", "name", "track"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    /// Rounded to a whole number
    Tempo,
    /// Probability-like value, three decimals, expected in [0, 1]
    Score,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

impl Column {
    fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self { name: name.into(), kind }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// Feature columns, i.e. everything after `filename`
    fields: Vec<Column>,
}

/// Where each canonical column lives in one artifact's header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMap {
    filename: Vec<usize>,
    fields: Vec<usize>,
}

impl HeaderMap {
    /// First non-empty value among the filename alias columns.
    pub fn filename<'r>(&self, record: &'r StringRecord) -> Option<&'r str> {
        self.filename
            .iter()
            .filter_map(|&i| record.get(i))
            .map(str::trim)
            .find(|v| !v.is_empty())
    }

    pub fn field<'r>(&self, record: &'r StringRecord, position: usize) -> &'r str {
        self.fields
            .get(position)
            .and_then(|&i| record.get(i))
            .unwrap_or("")
    }
}

pub fn normalize_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .trim()
        .to_lowercase()
        .replace([' ', '-'], "_")
}

impl Schema {
    pub fn new(mood_columns: &[String], genre_columns: &[String]) -> Self {
        let mut fields = vec![
            Column::new(TEMPO_COLUMN, ColumnKind::Tempo),
            Column::new(KEY_COLUMN, ColumnKind::Text),
        ];
        for name in mood_columns.iter().chain(genre_columns) {
            fields.push(Column::new(normalize_header(name), ColumnKind::Score));
        }
        fields.push(Column::new(DANCEABILITY_COLUMN, ColumnKind::Score));
        Self { fields }
    }

    pub fn from_config(config: &MergeConfig) -> Self {
        Self::new(&config.mood_columns, &config.genre_columns)
    }

    pub fn fields(&self) -> &[Column] {
        &self.fields
    }

    /// Full output header: `filename` followed by the feature columns.
    pub fn header(&self) -> Vec<&str> {
        std::iter::once(FILENAME_COLUMN)
            .chain(self.fields.iter().map(|c| c.name.as_str()))
            .collect()
    }

    /// Map a header onto the schema. Extra columns are ignored; the error
    /// lists every required column that is missing.
    pub fn resolve_header(&self, header: &StringRecord) -> Result<HeaderMap, Vec<String>> {
        let normalized: Vec<String> = header.iter().map(normalize_header).collect();
        let position = |name: &str| normalized.iter().position(|h| h == name);

        let filename: Vec<usize> = FILENAME_ALIASES.iter().filter_map(|&alias| position(alias)).collect();
        let mut missing = Vec::new();
        if filename.is_empty() {
            missing.push(FILENAME_COLUMN.to_string());
        }

        let mut fields = Vec::with_capacity(self.fields.len());
        for column in &self.fields {
            match position(column.name.as_str()) {
                Some(index) => fields.push(index),
                None => missing.push(column.name.clone()),
            }
        }

        if missing.is_empty() {
            Ok(HeaderMap { filename, fields })
        } else {
            Err(missing)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedField {
    pub value: String,
    pub out_of_range: bool,
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Apply the output formatting rule for a column kind. Missing or
/// unparseable numbers become an empty field.
pub fn format_field(kind: ColumnKind, raw: &str) -> FormattedField {
    match kind {
        ColumnKind::Text => FormattedField { value: raw.trim().to_string(), out_of_range: false },
        ColumnKind::Tempo => FormattedField {
            value: parse_number(raw).map(|v| format!("{}", v.round() as i64)).unwrap_or_default(),
            out_of_range: false,
        },
        ColumnKind::Score => match parse_number(raw) {
            Some(v) => FormattedField {
                value: format!("{:.3}", v),
                out_of_range: !(0.0..=1.0).contains(&v),
            },
            None => FormattedField { value: String::new(), out_of_range: false },
        },
    }
}
