use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One row of a tabular dataset: column name to scalar cell.
pub type Row = Map<String, Value>;

/// Rows in file order. Columns may vary per row.
pub type TabularDataset = Vec<Row>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedDataset {
    pub name: String,
    pub rows: TabularDataset,
}

impl NamedDataset {
    /// Column names of the first row, which downstream code treats as the
    /// dataset's approximate shape.
    pub fn columns(&self) -> Vec<String> {
        self.rows
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn sample(&self, n: usize) -> &[Row] {
        &self.rows[..self.rows.len().min(n)]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetData {
    pub name: String,
    pub headers: Vec<String>,
    pub sample_rows: Vec<Vec<Value>>,
}

/// A parsed upload. `sheets` is what prompts see; `tables` keeps the full
/// header-keyed rows of every sheet for the comparator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub name: String,
    #[serde(rename = "type")]
    pub file_type: String,
    pub sheets: Vec<SheetData>,
    #[serde(skip)]
    pub tables: Vec<NamedDataset>,
}

impl FileData {
    pub fn first_two_tables(&self) -> Option<(&NamedDataset, &NamedDataset)> {
        match self.tables.as_slice() {
            [first, second, ..] => Some((first, second)),
            _ => None,
        }
    }
}
