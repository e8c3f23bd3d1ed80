//! Raw tabular payloads as produced by the adapters.
//!
//! Adapters flatten whatever the provider returns into a header plus string
//! rows and serialize that as CSV. Cells are kept as text so that the parser,
//! not the adapter, decides what is malformed.

use super::provider::DataError;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new<S: Into<String>>(headers: impl IntoIterator<Item = S>) -> Self {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Serialize as CSV with a header line.
    pub fn to_csv(&self) -> Result<Vec<u8>, DataError> {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(Vec::new());
        writer.write_record(&self.headers).map_err(csv_error)?;
        for row in &self.rows {
            writer.write_record(row).map_err(csv_error)?;
        }
        writer
            .into_inner()
            .map_err(|e| DataError::EncodeFailure(format!("flush: {e}")))
    }
}

fn csv_error(e: csv::Error) -> DataError {
    DataError::EncodeFailure(e.to_string())
}
