//! Excel import and export of a karte grid.

use std::io::Cursor;

use calamine::{Data, Reader, Xlsx, open_workbook_from_rs};
use chrono::{Local, NaiveDate};
use log::{debug, warn};
use rust_xlsxwriter::{Format, Workbook, XlsxError};

use crate::error::ParseError;
use crate::grid::Grid;
use crate::template::{COLUMN_WIDTHS, MergedRegion, SHEET_NAME};
use crate::totals::parse_number;

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Read the first worksheet of an `.xlsx` file into a grid.
///
/// Cells keep their absolute position, so a sheet whose used area starts
/// below or right of `A1` is loaded with leading blank rows and columns.
pub fn parse_workbook(bytes: &[u8]) -> Result<Grid, ParseError> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(ParseError::EmptyWorkbook)?;
    let range = workbook.worksheet_range(&sheet_name)?;

    let Some((first_row, first_col)) = range.start() else {
        return Err(ParseError::EmptyWorkbook);
    };

    let mut grid = Grid::default();
    for (r, c, data) in range.used_cells() {
        let text = cell_text(data);
        if !text.is_empty() {
            grid.set(first_row as usize + r, first_col as usize + c, text);
        }
    }
    debug!(
        "parsed sheet `{sheet_name}` into {}x{} cells",
        grid.row_count(),
        grid.col_count()
    );
    Ok(grid)
}

fn cell_text(data: &Data) -> String {
    match data {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => number_text(*f),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string().to_uppercase(),
        other => other.to_string(),
    }
}

/// Whole numbers without a fraction, others in their shortest exact form.
fn number_text(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Numeric cells whose text is exactly how the number prints; anything else
/// (`"1,000"`, `"007"`) stays a string so it reads back unchanged.
fn canonical_number(text: &str) -> Option<f64> {
    let value = parse_number(text)?;
    (number_text(value) == text).then_some(value)
}

/// Build an `.xlsx` file holding `grid` on the karte sheet.
pub fn build_workbook(grid: &Grid, merges: &[MergedRegion]) -> Result<Vec<u8>, XlsxError> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(SHEET_NAME)?;

    for (col, width) in COLUMN_WIDTHS.iter().enumerate() {
        worksheet.set_column_width(col as u16, f64::from(*width) / 8.0)?;
    }

    let merge_format = Format::new();
    for region in merges {
        if region.rowspan * region.colspan <= 1 {
            continue;
        }
        if let Err(err) = worksheet.merge_range(
            region.row as u32,
            region.col as u16,
            region.last_row() as u32,
            region.last_col() as u16,
            "",
            &merge_format,
        ) {
            warn!("skipping merge at ({}, {}): {err}", region.row, region.col);
        }
    }

    for (r, row) in grid.rows().iter().enumerate() {
        for (c, value) in row.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            match canonical_number(value) {
                Some(number) => worksheet.write_number(r as u32, c as u16, number)?,
                None => worksheet.write_string(r as u32, c as u16, value)?,
            };
        }
    }

    workbook.save_to_buffer()
}

/// `カルテ_YYYY-MM-DD.xlsx`
pub fn export_file_name(date: NaiveDate) -> String {
    format!("カルテ_{}.xlsx", date.format("%Y-%m-%d"))
}

pub fn export_file_name_today() -> String {
    export_file_name(Local::now().date_naive())
}
