//! Display names for routes and stops, read from static GTFS reference tables.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum NamesError {
    #[error("failed to read reference table {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed reference table: {0}")]
    Csv(#[from] csv::Error),

    #[error("reference table is missing required column `{0}`")]
    MissingColumn(&'static str),
}

/// Resolves route and stop ids to human-readable names.
///
/// A miss is not an error: callers fall back to an empty name.
pub trait NameLookup: Send + Sync {
    fn route_name(&self, route_id: &str) -> Option<&str>;
    fn stop_name(&self, stop_id: &str) -> Option<&str>;
}

/// In-memory id-to-name tables, built once at startup and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct NameTables {
    routes: HashMap<String, String>,
    stops: HashMap<String, String>,
}

impl NameTables {
    pub fn new(routes: HashMap<String, String>, stops: HashMap<String, String>) -> Self {
        Self { routes, stops }
    }

    /// Loads `routes.txt` and `stops.txt` style CSV files.
    pub fn load(routes_path: &str, stops_path: &str) -> Result<Self, NamesError> {
        let routes = read_table(routes_path, "route_id", "route_short_name")?;
        let stops = read_table(stops_path, "stop_id", "stop_name")?;

        info!(
            routes = routes.len(),
            stops = stops.len(),
            "Reference tables loaded"
        );

        Ok(Self { routes, stops })
    }

    pub fn from_readers<R: Read, S: Read>(routes: R, stops: S) -> Result<Self, NamesError> {
        Ok(Self {
            routes: read_columns(routes, "route_id", "route_short_name")?,
            stops: read_columns(stops, "stop_id", "stop_name")?,
        })
    }
}

impl NameLookup for NameTables {
    fn route_name(&self, route_id: &str) -> Option<&str> {
        self.routes.get(route_id).map(String::as_str)
    }

    fn stop_name(&self, stop_id: &str) -> Option<&str> {
        self.stops.get(stop_id).map(String::as_str)
    }
}

fn read_table(
    path: &str,
    key_column: &'static str,
    value_column: &'static str,
) -> Result<HashMap<String, String>, NamesError> {
    let file = std::fs::File::open(Path::new(path)).map_err(|source| NamesError::Io {
        path: path.to_string(),
        source,
    })?;
    read_columns(file, key_column, value_column)
}

/// Reads two columns, located by header name, into a map.
///
/// Extra columns are ignored and rows too short to hold either column are skipped.
fn read_columns<R: Read>(
    reader: R,
    key_column: &'static str,
    value_column: &'static str,
) -> Result<HashMap<String, String>, NamesError> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let position = |name: &'static str| {
        headers
            .iter()
            .position(|h| h.trim_start_matches('\u{feff}') == name)
            .ok_or(NamesError::MissingColumn(name))
    };
    let key_idx = position(key_column)?;
    let value_idx = position(value_column)?;

    let mut table = HashMap::new();
    let mut skipped = 0usize;

    for record in rdr.records() {
        let record = record?;
        match (record.get(key_idx), record.get(value_idx)) {
            (Some(key), Some(value)) => {
                table.insert(key.to_string(), value.to_string());
            }
            _ => skipped += 1,
        }
    }

    if skipped > 0 {
        debug!(key_column, skipped, "Short rows skipped");
    }

    Ok(table)
}
