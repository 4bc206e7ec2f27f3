//! The persisted karte record and the schema versions it has been stored in.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{Local, TimeZone};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{ParseError, StoreError};
use crate::grid::Grid;
use crate::template;

/// Opaque document id of a record inside its collection.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn generate() -> Self {
        RecordId(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        RecordId(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        RecordId(id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one editing session (one browser tab).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EditorId(String);

impl EditorId {
    pub fn generate() -> Self {
        EditorId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EditorId {
    fn from(id: &str) -> Self {
        EditorId(id.to_string())
    }
}

impl fmt::Display for EditorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn now() -> Self {
        Timestamp(chrono::Utc::now().timestamp_millis())
    }

    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis)
    }

    pub fn millis(self) -> i64 {
        self.0
    }

    /// The next strictly greater timestamp, or `self + 1ms` if the clock lags.
    pub fn next_after(self, clock: Timestamp) -> Timestamp {
        Timestamp(clock.0.max(self.0 + 1))
    }

    pub fn elapsed_since(self, earlier: Timestamp) -> std::time::Duration {
        std::time::Duration::from_millis(self.0.saturating_sub(earlier.0).max(0) as u64)
    }

    /// Local wall-clock rendering used in "last saved" labels.
    pub fn to_local_string(self) -> String {
        match Local.timestamp_millis_opt(self.0).single() {
            Some(dt) => dt.format("%Y/%m/%d %H:%M:%S").to_string(),
            None => self.0.to_string(),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Marker that an editor currently has the record open.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub name: String,
    pub last_active: Timestamp,
}

pub type ActiveEditors = BTreeMap<EditorId, PresenceEntry>;

/// Cells promoted to indexed fields, used by the record list.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub karte_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tantosha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dantai_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stay_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person_count: Option<String>,
}

impl RecordInfo {
    /// Each field is the non-blank cell to the right of its label.
    pub fn extract(grid: &Grid) -> Self {
        let right_of = |label: &str| {
            grid.find_label(label)
                .map(|(r, c)| grid.get(r, c + 1).trim())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        RecordInfo {
            karte_no: right_of(template::KARTE_NO),
            tantosha: right_of(template::TANTOSHA),
            name: right_of(template::NAME),
            dantai_name: right_of(template::DANTAI_NAME),
            stay_date: right_of(template::STAY_DATE),
            destination: right_of(template::DESTINATION),
            person_count: right_of(template::PERSON_COUNT),
        }
    }
}

/// A karte, normalized to the current schema.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    pub grid: Grid,
    pub info: RecordInfo,
    pub last_updated: Timestamp,
    pub active_editors: ActiveEditors,
    /// Editor whose write produced this version, when the writer tagged it.
    pub origin: Option<EditorId>,
}

impl Record {
    pub fn blank(id: RecordId) -> Self {
        let grid = template::blank_karte();
        Record {
            id,
            info: RecordInfo::extract(&grid),
            grid,
            last_updated: Timestamp::ZERO,
            active_editors: ActiveEditors::new(),
            origin: None,
        }
    }

    /// Encode in the current schema, tagging the write with `origin`.
    pub fn to_document(&self) -> Result<StoredDocument, StoreError> {
        let grid_serialized = serde_json::to_string(&self.grid)
            .map_err(|e| StoreError::Encoding(e.to_string()))?;
        Ok(StoredDocument::Current {
            derived_info: RecordInfo::extract(&self.grid),
            grid_serialized,
            active_editors: self.active_editors.clone(),
            origin: self.origin.clone(),
        })
    }
}

/// Every shape a karte document has been persisted in.
///
/// Older shapes are read and migrated by [`StoredDocument::into_record`];
/// new writes always use [`StoredDocument::Current`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StoredDocument {
    /// `sheetData`: the grid as a bare 2-D array.
    Legacy {
        karte_info: Option<RecordInfo>,
        sheet_data: Vec<Vec<String>>,
    },
    /// `serializedSheetData`: `rowN` -> `colN` -> value.
    RowKeyed {
        karte_info: Option<RecordInfo>,
        rows: BTreeMap<String, BTreeMap<String, String>>,
        active_editors: ActiveEditors,
    },
    /// `gridSerialized`: the grid as a JSON-encoded 2-D array.
    Current {
        derived_info: RecordInfo,
        grid_serialized: String,
        active_editors: ActiveEditors,
        origin: Option<EditorId>,
    },
}

impl StoredDocument {
    /// Recognize the schema of a raw JSON document.
    pub fn from_json(value: &Value) -> Result<Self, ParseError> {
        let object = value
            .as_object()
            .ok_or_else(|| ParseError::Document("document is not an object".into()))?;

        let info = |key: &str| -> Result<Option<RecordInfo>, ParseError> {
            match object.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            }
        };
        let editors = || -> Result<ActiveEditors, ParseError> {
            match object.get("activeEditors") {
                None | Some(Value::Null) => Ok(ActiveEditors::new()),
                Some(v) => Ok(serde_json::from_value(v.clone())?),
            }
        };

        if let Some(grid) = object.get("gridSerialized") {
            let grid_serialized = match grid {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Ok(StoredDocument::Current {
                derived_info: info("derivedInfo")?.unwrap_or_default(),
                grid_serialized,
                active_editors: editors()?,
                origin: object
                    .get("origin")
                    .and_then(Value::as_str)
                    .map(EditorId::from),
            });
        }

        if let Some(serialized) = object.get("serializedSheetData") {
            let raw = serialized.as_object().ok_or_else(|| {
                ParseError::Document("serializedSheetData is not an object".into())
            })?;
            let mut rows = BTreeMap::new();
            for (row_key, row) in raw {
                let cols = row
                    .as_object()
                    .ok_or_else(|| ParseError::Document(format!("{row_key} is not an object")))?
                    .iter()
                    .map(|(col_key, cell)| (col_key.clone(), json_cell_text(cell)))
                    .collect();
                rows.insert(row_key.clone(), cols);
            }
            return Ok(StoredDocument::RowKeyed {
                karte_info: info("karteInfo")?,
                rows,
                active_editors: editors()?,
            });
        }

        if let Some(sheet) = object.get("sheetData") {
            return Ok(StoredDocument::Legacy {
                karte_info: info("karteInfo")?,
                sheet_data: json_rows(sheet)?,
            });
        }

        Err(ParseError::Document("no grid field found".into()))
    }

    /// Render in the current JSON shape.
    pub fn to_json(&self, last_updated: Timestamp) -> Value {
        match self {
            StoredDocument::Current {
                derived_info,
                grid_serialized,
                active_editors,
                origin,
            } => json!({
                "derivedInfo": derived_info,
                "gridSerialized": grid_serialized,
                "lastUpdated": last_updated,
                "activeEditors": active_editors,
                "origin": origin,
            }),
            StoredDocument::RowKeyed {
                karte_info,
                rows,
                active_editors,
            } => json!({
                "karteInfo": karte_info,
                "serializedSheetData": rows,
                "lastUpdated": last_updated,
                "activeEditors": active_editors,
            }),
            StoredDocument::Legacy {
                karte_info,
                sheet_data,
            } => json!({
                "karteInfo": karte_info,
                "sheetData": sheet_data,
                "lastUpdated": last_updated,
            }),
        }
    }

    /// Decode the grid, whatever the schema.
    pub fn grid(&self) -> Result<Grid, ParseError> {
        match self {
            StoredDocument::Current {
                grid_serialized, ..
            } => {
                let value: Value = serde_json::from_str(grid_serialized)?;
                Ok(Grid::from_rows(json_rows(&value)?))
            }
            StoredDocument::RowKeyed { rows, .. } => {
                let mut ordered = rows
                    .iter()
                    .map(|(key, cols)| Ok((keyed_index(key, "row")?, cols)))
                    .collect::<Result<Vec<_>, ParseError>>()?;
                ordered.sort_by_key(|(index, _)| *index);

                let mut out = Vec::with_capacity(ordered.len());
                for (_, cols) in ordered {
                    let mut cells = cols
                        .iter()
                        .map(|(key, value)| Ok((keyed_index(key, "col")?, value.clone())))
                        .collect::<Result<Vec<_>, ParseError>>()?;
                    cells.sort_by_key(|(index, _)| *index);
                    out.push(cells.into_iter().map(|(_, value)| value).collect());
                }
                Ok(Grid::from_rows(out))
            }
            StoredDocument::Legacy { sheet_data, .. } => Ok(Grid::from_rows(sheet_data.clone())),
        }
    }

    fn stored_info(&self) -> Option<&RecordInfo> {
        match self {
            StoredDocument::Current { derived_info, .. } => Some(derived_info),
            StoredDocument::RowKeyed { karte_info, .. }
            | StoredDocument::Legacy { karte_info, .. } => karte_info.as_ref(),
        }
    }

    pub fn active_editors(&self) -> ActiveEditors {
        match self {
            StoredDocument::Current { active_editors, .. }
            | StoredDocument::RowKeyed { active_editors, .. } => active_editors.clone(),
            StoredDocument::Legacy { .. } => ActiveEditors::new(),
        }
    }

    pub fn origin(&self) -> Option<&EditorId> {
        match self {
            StoredDocument::Current { origin, .. } => origin.as_ref(),
            _ => None,
        }
    }

    /// Replace the presence map and tag the write, leaving the grid as stored.
    ///
    /// A current document keeps its `gridSerialized` text byte for byte, even
    /// when it cannot be decoded. Older shapes are migrated, which needs a
    /// readable grid.
    pub fn with_presence(
        self,
        active_editors: ActiveEditors,
        origin: EditorId,
    ) -> Result<StoredDocument, ParseError> {
        if let StoredDocument::Current {
            derived_info,
            grid_serialized,
            ..
        } = self
        {
            return Ok(StoredDocument::Current {
                derived_info,
                grid_serialized,
                active_editors,
                origin: Some(origin),
            });
        }

        let grid = self.grid()?;
        let derived_info = match self.stored_info() {
            Some(info) if *info != RecordInfo::default() => info.clone(),
            _ => RecordInfo::extract(&grid),
        };
        Ok(StoredDocument::Current {
            derived_info,
            grid_serialized: serde_json::to_string(&grid)?,
            active_editors,
            origin: Some(origin),
        })
    }

    /// Migrate to a [`Record`]. A malformed or empty grid falls back to the
    /// blank template instead of failing the load.
    pub fn into_record(self, id: RecordId, last_updated: Timestamp) -> Record {
        let grid = match self.grid() {
            Ok(grid) if grid.row_count() > 0 => grid,
            Ok(_) => template::blank_karte(),
            Err(err) => {
                warn!("karte {id}: {err}; loading the blank template instead");
                template::blank_karte()
            }
        };
        let info = match self.stored_info() {
            Some(info) if *info != RecordInfo::default() => info.clone(),
            _ => RecordInfo::extract(&grid),
        };

        Record {
            id,
            grid,
            info,
            last_updated,
            active_editors: self.active_editors(),
            origin: self.origin().cloned(),
        }
    }
}

/// One version of a record as held by the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: RecordId,
    pub last_updated: Timestamp,
    pub document: StoredDocument,
}

impl Snapshot {
    pub fn into_record(self) -> Record {
        self.document.into_record(self.id, self.last_updated)
    }
}

fn keyed_index(key: &str, prefix: &str) -> Result<usize, ParseError> {
    key.strip_prefix(prefix)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| ParseError::Document(format!("unexpected key `{key}`")))
}

fn json_cell_text(cell: &Value) -> String {
    match cell {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_rows(value: &Value) -> Result<Vec<Vec<String>>, ParseError> {
    let rows = value
        .as_array()
        .ok_or_else(|| ParseError::Document("grid is not an array".into()))?;
    rows.iter()
        .map(|row| match row {
            Value::Array(cells) => Ok(cells.iter().map(json_cell_text).collect()),
            Value::Null => Ok(Vec::new()),
            _ => Err(ParseError::Document("grid row is not an array".into())),
        })
        .collect()
}
