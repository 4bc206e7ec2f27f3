use thiserror::Error;

use crate::record::RecordId;

/// Failures reported by a [`RecordStore`](crate::store::RecordStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record id does not exist in the collection.
    #[error("record `{0}` does not exist")]
    NotFound(RecordId),

    /// Transport or permission failure (the store could not be reached).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backing file of a persistent store could not be read or written.
    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// A snapshot could not be encoded or decoded.
    #[error("store encoding failed: {0}")]
    Encoding(String),
}

/// Malformed imported workbooks or persisted grids.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read workbook: {0}")]
    Workbook(String),

    #[error("workbook contains no worksheet")]
    EmptyWorkbook,

    #[error("malformed karte document: {0}")]
    Document(String),
}

/// The grid widget was in a state where the requested operation could not run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("cell ({row}, {col}) is outside the grid bounds")]
    OutOfBounds { row: usize, col: usize },

    #[error("grid widget is not attached")]
    Detached,
}

/// Errors surfaced to whoever triggered a karte operation.
///
/// None of these are fatal: an editing session keeps running after any of
/// them and reports the failure in place.
#[derive(Debug, Error)]
pub enum KarteError {
    #[error("karte `{0}` was not found")]
    NotFound(RecordId),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("failed to build workbook: {0}")]
    Export(#[from] rust_xlsxwriter::XlsxError),

    #[error("`{0}` is not a cell name")]
    InvalidCell(String),

    #[error("editing session has shut down")]
    SessionClosed,
}

impl From<StoreError> for KarteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => KarteError::NotFound(id),
            other => KarteError::Store(other),
        }
    }
}

impl From<calamine::XlsxError> for ParseError {
    fn from(err: calamine::XlsxError) -> Self {
        ParseError::Workbook(err.to_string())
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::Document(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_becomes_karte_not_found() {
        let err: KarteError = StoreError::NotFound(RecordId::from("abc")).into();
        assert!(matches!(err, KarteError::NotFound(ref id) if id.as_str() == "abc"));
        assert_eq!(err.to_string(), "karte `abc` was not found");
    }

    #[test]
    fn transport_failures_stay_store_errors() {
        let err: KarteError = StoreError::Unavailable("offline".into()).into();
        assert!(matches!(err, KarteError::Store(StoreError::Unavailable(_))));
        assert_eq!(err.to_string(), "store unavailable: offline");
    }
}
