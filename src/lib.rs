/*!
# Karte Editor

The editing core of a browser-based karte (business record) editor, built in Rust.

## Overview

A karte is a fixed-layout form kept as one document in a document store: basic
booking details, incoming payments, outgoing payments and a profit summary.
Several people may have the same karte open at once. This crate keeps every
open copy in step with the store without clobbering local edits, shows who else
is editing, keeps the derived totals up to date and converts kartes to and from
Excel workbooks.

## Architecture

### Editing Layer
- **EditingSession** - One per browser tab. Owns the grid widget, the open
  record, its change subscription and every timer (autosave, recalculation,
  heartbeat, suppression window). Driven through a cloneable `SessionHandle`.
- **Echo Suppressor** - Tells the session's own writes, echoed back by the
  subscription, apart from genuine remote changes.
- **Presence Tracker** - Active-editor entries with heartbeat and expiry.
- **Derived-Totals Recalculator** - Recomputes payment/expense totals, profit,
  profit rate and per-person profit from label-located cells.

### Storage Layer
- **RecordStore** - get / put / delete / list / subscribe, last-writer-wins per
  document, store-assigned monotonic timestamps.
- **MemoryStore** - In-process store shared by all sessions of a server.
- **FileStore** - `MemoryStore` persisted with Gzip compression and bincode
  serialization.
- Historical document shapes (`sheetData`, `serializedSheetData`) are migrated
  to the current one on load.

### Web Layer (feature `web`)
- **Technologies**: Rust, axum
- REST endpoints for the record list, record CRUD, Excel import/export and
  server-side editing sessions.

## Modules

- **grid**: Grid data, A1 cell names, the grid widget interface
- **template**: The blank karte, its labels and merged regions
- **record**: Record, derived info and persisted document versions
- **store**: Record store interface and in-memory store
- **saving**: File-backed store
- **echo**: Echo suppression
- **presence**: Active editors
- **totals**: Derived totals
- **codec**: Excel import and export
- **session**: Editing session
- **config**: Configuration file and environment overrides
- **error**: Error types
- **app**: Routing and handlers

## REST API Endpoints

- `/api/karte` - List records, create a record
- `/api/karte/{id}` - Read or delete a record
- `/api/karte/{id}/export` - Download a record as `.xlsx`
- `/api/import` - Parse an uploaded workbook
- `/api/sessions/...` - Open, edit, save, import, export and close through an editing session
*/

#[cfg(feature = "web")]
pub mod app;
pub mod codec;
pub mod config;
pub mod echo;
pub mod error;
pub mod grid;
pub mod presence;
pub mod record;
pub mod saving;
pub mod session;
pub mod store;
pub mod template;
pub mod totals;

pub use config::KarteConfig;
pub use error::{KarteError, ParseError, RenderError, StoreError};
pub use grid::{ChangeSource, Grid, GridWidget, MemoryGrid};
pub use record::{EditorId, Record, RecordId, Timestamp};
pub use session::{EditingSession, SessionHandle, SessionStatus};
pub use store::{MemoryStore, RecordStore};
