//! Shared vocabulary types referenced across subsystem crates: provider
//! tags, file format tags, and the coarse schema model used for CSV/JSON
//! prefix sampling.

use serde::{Deserialize, Serialize};

/// Cloud provider tag, derived from a URL's hostname by the HTTP client's
/// `detect_provider`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderTag {
    S3,
    R2,
    Gcs,
    AzureBlob,
}

impl ProviderTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderTag::S3 => "s3",
            ProviderTag::R2 => "r2",
            ProviderTag::Gcs => "gcs",
            ProviderTag::AzureBlob => "azure-blob",
        }
    }
}

impl std::fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// File format, inferred from a URL's suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatTag {
    Columnar,
    Csv,
    Json,
    Jsonl,
    Arrow,
}

impl FormatTag {
    /// Infer a format from a URL path's suffix. Returns `None` for an
    /// unrecognized extension (the caller raises `UNSUPPORTED_FORMAT`).
    pub fn from_url(url: &str) -> Option<Self> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".parquet") {
            Some(FormatTag::Columnar)
        } else if lower.ends_with(".csv") {
            Some(FormatTag::Csv)
        } else if lower.ends_with(".jsonl") || lower.ends_with(".ndjson") {
            Some(FormatTag::Jsonl)
        } else if lower.ends_with(".json") {
            Some(FormatTag::Json)
        } else if lower.ends_with(".arrow") {
            Some(FormatTag::Arrow)
        } else {
            None
        }
    }

    /// The SQL engine file function used to read this format directly
    ///.
    pub fn read_function(&self) -> &'static str {
        match self {
            FormatTag::Columnar | FormatTag::Arrow => "read_parquet",
            FormatTag::Csv => "read_csv_auto",
            FormatTag::Json | FormatTag::Jsonl => "read_json_auto",
        }
    }

    /// The virtual-filename extension used when registering a proxied
    /// in-memory buffer with the SQL engine.
    pub fn virtual_extension(&self) -> &'static str {
        match self {
            FormatTag::Columnar | FormatTag::Arrow => "parquet",
            FormatTag::Csv => "csv",
            FormatTag::Json | FormatTag::Jsonl => "json",
        }
    }
}

/// Coarse column type used for lightweight schema peeking; the
/// embedded SQL engine resolves real types once a table is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Number,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
}

/// The schema inferred for a remote file, cached per URL until explicit
/// invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSchema {
    pub columns: Vec<ColumnSchema>,
    pub format: FormatTag,
    pub row_count: Option<u64>,
}

/// A query result in the shape cached by the query-result cache and
/// returned by the engine facade. Rows are kept as loosely-typed JSON
/// so this crate never needs to know the SQL engine's native row type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResultPayload {
    pub rows: Vec<serde_json::Value>,
    pub row_count: usize,
}

/// How a remote URL should be reached: direct cross-origin fetch, or
/// routed through the proxy service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CorsHandling {
    Direct,
    Proxy,
    #[default]
    Auto,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_inferred_from_suffix() {
        assert_eq!(FormatTag::from_url("https://x/data.csv"), Some(FormatTag::Csv));
        assert_eq!(FormatTag::from_url("https://x/data.PARQUET"), Some(FormatTag::Columnar));
        assert_eq!(FormatTag::from_url("https://x/data.jsonl?x=1"), Some(FormatTag::Jsonl));
        assert_eq!(FormatTag::from_url("https://x/data.txt"), None);
    }

    #[test]
    fn read_function_matches_format() {
        assert_eq!(FormatTag::Csv.read_function(), "read_csv_auto");
        assert_eq!(FormatTag::Json.read_function(), "read_json_auto");
        assert_eq!(FormatTag::Columnar.read_function(), "read_parquet");
    }
}
