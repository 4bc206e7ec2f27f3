use serde::{Deserialize, Serialize};

use crate::error::RenderError;

/// Hard limits of the grid.
pub const MAX_ROWS: usize = 999;
pub const MAX_COLS: usize = 18_278;

/// The 2-D array of cell values shown in the karte editor.
///
/// Rows may be ragged; reads outside the stored area yield an empty string.
/// Numbers are kept in their textual form and parsed on demand.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Grid {
    rows: Vec<Vec<String>>,
}

impl Grid {
    pub fn new(rows: usize, cols: usize) -> Self {
        Grid {
            rows: vec![vec![String::new(); cols]; rows],
        }
    }

    pub fn from_rows(rows: Vec<Vec<String>>) -> Self {
        Grid { rows }
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<String>> {
        self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Width of the widest row.
    pub fn col_count(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn get(&self, row: usize, col: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Set a cell, growing the grid when the address lies outside it.
    pub fn set(&mut self, row: usize, col: usize, value: impl Into<String>) {
        if self.rows.len() <= row {
            self.rows.resize_with(row + 1, Vec::new);
        }
        let r = &mut self.rows[row];
        if r.len() <= col {
            r.resize(col + 1, String::new());
        }
        r[col] = value.into();
    }

    /// Pad with blank cells up to at least `min_rows` x `min_cols`, squaring ragged rows.
    pub fn padded(mut self, min_rows: usize, min_cols: usize) -> Self {
        let width = self.col_count().max(min_cols);
        if self.rows.len() < min_rows {
            self.rows.resize_with(min_rows, Vec::new);
        }
        for row in &mut self.rows {
            row.resize(width, String::new());
        }
        self
    }

    pub fn insert_row(&mut self, at: usize) {
        let width = self.col_count();
        let at = at.min(self.rows.len());
        self.rows.insert(at, vec![String::new(); width]);
    }

    pub fn remove_row(&mut self, at: usize) -> Option<Vec<String>> {
        (at < self.rows.len()).then(|| self.rows.remove(at))
    }

    /// First cell (row-major) whose text matches `label`.
    pub fn find_label(&self, label: &str) -> Option<(usize, usize)> {
        self.find_label_from(label, 0)
    }

    pub fn find_label_from(&self, label: &str, start_row: usize) -> Option<(usize, usize)> {
        self.rows
            .iter()
            .enumerate()
            .skip(start_row)
            .find_map(|(r, row)| {
                row.iter()
                    .position(|cell| label_matches(cell, label))
                    .map(|c| (r, c))
            })
    }

    /// Row index of the first row at or after `start_row` whose first column matches `label`.
    pub fn find_row_label(&self, label: &str, start_row: usize) -> Option<usize> {
        self.rows
            .iter()
            .enumerate()
            .skip(start_row)
            .find(|(_, row)| row.first().is_some_and(|cell| label_matches(cell, label)))
            .map(|(r, _)| r)
    }

    /// Equality of visible content, ignoring trailing blank padding.
    pub fn same_content(&self, other: &Grid) -> bool {
        let rows = self.row_count().max(other.row_count());
        let cols = self.col_count().max(other.col_count());
        (0..rows).all(|r| (0..cols).all(|c| self.get(r, c) == other.get(r, c)))
    }
}

/// Label comparison used by every sentinel lookup: whitespace (including the
/// line breaks used in wrapped header cells) is ignored.
pub fn label_matches(cell: &str, label: &str) -> bool {
    let mut a = cell.chars().filter(|c| !c.is_whitespace());
    let mut b = label.chars().filter(|c| !c.is_whitespace());
    loop {
        match (a.next(), b.next()) {
            (None, None) => return true,
            (Some(x), Some(y)) if x == y => continue,
            _ => return false,
        }
    }
}

/// Column letters for a 1-based column number (1 -> A, 27 -> AA).
pub fn col_to_letter(col: usize) -> String {
    let mut col = col;
    let mut result = String::new();
    while col > 0 {
        col -= 1;
        result.push(((col % 26) as u8 + b'A') as char);
        col /= 26;
    }
    result.chars().rev().collect()
}

pub fn letter_to_col(letters: &str) -> usize {
    letters.chars().fold(0, |acc, c| {
        acc * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1)
    })
}

/// A1-style name of a 0-based cell address.
pub fn cell_name(row: usize, col: usize) -> String {
    format!("{}{}", col_to_letter(col + 1), row + 1)
}

/// Parse an A1-style name into a 0-based `(row, col)` address.
pub fn parse_cell_name(cell_name: &str) -> Option<(usize, usize)> {
    let mut letters = String::new();
    let mut digits = String::new();
    let mut found_digit = false;

    for c in cell_name.trim().chars() {
        if c.is_ascii_alphabetic() {
            if found_digit {
                return None;
            }
            letters.push(c);
        } else if c.is_ascii_digit() {
            found_digit = true;
            digits.push(c);
        } else {
            return None;
        }
    }

    if letters.is_empty() || digits.is_empty() || letters.len() > 3 {
        return None;
    }

    let col = letter_to_col(&letters);
    let row = digits.parse::<usize>().ok()?;

    if col == 0 || col > MAX_COLS || row == 0 || row > MAX_ROWS {
        return None;
    }
    Some((row - 1, col - 1))
}

/// Why a set of cells changed; passed along with every change notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    Edit,
    Paste,
    RowInsert,
    RowRemove,
    /// Whole-grid load (open, remote snapshot, import, template).
    Load,
    /// Written back by the derived-totals recalculation.
    Recalc,
}

impl ChangeSource {
    /// Changes made by the local user; these schedule an autosave.
    pub fn is_user_edit(self) -> bool {
        matches!(
            self,
            ChangeSource::Edit | ChangeSource::Paste | ChangeSource::RowInsert | ChangeSource::RowRemove
        )
    }

    /// A recalculation's own writes never schedule another recalculation.
    pub fn triggers_recalc(self) -> bool {
        self != ChangeSource::Recalc
    }
}

/// One `onCellsChanged` notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeBatch {
    pub source: ChangeSource,
    pub cells: Vec<(usize, usize)>,
}

/// The on-screen grid control, seen from the editing core.
///
/// Change notifications are queued by the widget and drained by the owner
/// with [`GridWidget::take_changes`], so no callback ever re-enters the core
/// while it is mutating the widget.
pub trait GridWidget: Send + 'static {
    fn load_grid(&mut self, grid: Grid) -> Result<(), RenderError>;

    fn read_grid(&self) -> Result<Grid, RenderError>;

    fn set_cell(
        &mut self,
        row: usize,
        col: usize,
        value: &str,
        source: ChangeSource,
    ) -> Result<(), RenderError>;

    fn insert_row(&mut self, at: usize) -> Result<(), RenderError>;

    fn remove_row(&mut self, at: usize) -> Result<(), RenderError>;

    fn take_changes(&mut self) -> Vec<ChangeBatch>;
}

/// Headless widget holding the grid in memory.
#[derive(Debug, Default)]
pub struct MemoryGrid {
    grid: Option<Grid>,
    changes: Vec<ChangeBatch>,
    loads: usize,
}

impl MemoryGrid {
    pub fn new() -> Self {
        MemoryGrid {
            grid: Some(Grid::default()),
            changes: Vec::new(),
            loads: 0,
        }
    }

    /// A widget whose DOM node is gone; every operation fails.
    pub fn detached() -> Self {
        MemoryGrid {
            grid: None,
            changes: Vec::new(),
            loads: 0,
        }
    }

    /// Number of whole-grid loads performed so far.
    pub fn load_count(&self) -> usize {
        self.loads
    }

    fn grid_mut(&mut self) -> Result<&mut Grid, RenderError> {
        self.grid.as_mut().ok_or(RenderError::Detached)
    }
}

impl GridWidget for MemoryGrid {
    fn load_grid(&mut self, grid: Grid) -> Result<(), RenderError> {
        let (rows, cols) = (grid.row_count(), grid.col_count());
        *self.grid_mut()? = grid;
        let cells = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .collect();
        self.loads += 1;
        self.changes.push(ChangeBatch {
            source: ChangeSource::Load,
            cells,
        });
        Ok(())
    }

    fn read_grid(&self) -> Result<Grid, RenderError> {
        self.grid.clone().ok_or(RenderError::Detached)
    }

    fn set_cell(
        &mut self,
        row: usize,
        col: usize,
        value: &str,
        source: ChangeSource,
    ) -> Result<(), RenderError> {
        if row >= MAX_ROWS || col >= MAX_COLS {
            return Err(RenderError::OutOfBounds { row, col });
        }
        let grid = self.grid_mut()?;
        if grid.get(row, col) == value {
            return Ok(());
        }
        grid.set(row, col, value);
        self.changes.push(ChangeBatch {
            source,
            cells: vec![(row, col)],
        });
        Ok(())
    }

    fn insert_row(&mut self, at: usize) -> Result<(), RenderError> {
        let grid = self.grid_mut()?;
        if grid.row_count() >= MAX_ROWS {
            return Err(RenderError::OutOfBounds { row: at, col: 0 });
        }
        grid.insert_row(at);
        self.changes.push(ChangeBatch {
            source: ChangeSource::RowInsert,
            cells: Vec::new(),
        });
        Ok(())
    }

    fn remove_row(&mut self, at: usize) -> Result<(), RenderError> {
        let grid = self.grid_mut()?;
        grid.remove_row(at)
            .ok_or(RenderError::OutOfBounds { row: at, col: 0 })?;
        self.changes.push(ChangeBatch {
            source: ChangeSource::RowRemove,
            cells: Vec::new(),
        });
        Ok(())
    }

    fn take_changes(&mut self) -> Vec<ChangeBatch> {
        std::mem::take(&mut self.changes)
    }
}
