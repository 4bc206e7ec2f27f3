//! The blank karte form: cell contents, column widths and merged regions.
//!
//! Every position that the rest of the crate cares about is found through the
//! sentinel labels below, never through fixed row numbers, because rows can be
//! inserted into or removed from a karte.

use serde::{Deserialize, Serialize};

use crate::grid::Grid;

pub const TEMPLATE_COLS: usize = 8;

pub const BASIC_SECTION: &str = "◆ 基本情報";
pub const TITLE: &str = "【団体ナビ成約カルテ】";
pub const PAYMENT_SECTION: &str = "◆ 入金情報";
pub const EXPENSE_SECTION: &str = "◆ 支払情報";
pub const PROFIT_SECTION: &str = "◆ 収支情報";
pub const SUPERVISOR_CHECK: &str = "上席チェック";

pub const PAYMENT_TOTAL: &str = "A；入金合計";
pub const EXPENSE_TOTAL: &str = "B；支払合計";

pub const PAYMENT_AMOUNT_HEADER: &str = "入金額";
pub const EXPENSE_AMOUNT_HEADER: &str = "支払金額";

pub const PROFIT_RATE_HEADER: &str = "利益率";
pub const PROFIT_HEADER: &str = "利益額";
pub const PER_PERSON_HEADER: &str = "一人粗利";
pub const TRAVEL_TOTAL_HEADER: &str = "旅行総額/A";
pub const EXPENSE_SUMMARY_HEADER: &str = "支払総額/B";
pub const SUMMARY_PERSONS_HEADER: &str = "人数";

pub const KARTE_NO: &str = "カルテNo";
pub const TANTOSHA: &str = "担当；";
pub const NAME: &str = "名前";
pub const DANTAI_NAME: &str = "団体名";
pub const STAY_DATE: &str = "宿泊日";
pub const DESTINATION: &str = "行先";
pub const PERSON_COUNT: &str = "合計\n人数";

/// Widths in pixels, as laid out by the grid widget.
pub const COLUMN_WIDTHS: [u16; TEMPLATE_COLS] = [140, 120, 120, 120, 120, 120, 120, 120];

/// Worksheet name used when exporting.
pub const SHEET_NAME: &str = "カルテデータ";

const TEMPLATE: &[[&str; TEMPLATE_COLS]] = &[
    [BASIC_SECTION, "", "", "", "", "", "", ""],
    [TITLE, "", TANTOSHA, "", "記入日;", "", "個人通N0;", ""],
    [KARTE_NO, "", NAME, "", DANTAI_NAME, "", "電話", ""],
    [STAY_DATE, "", "泊数", "", PERSON_COUNT, "", "成約日", ""],
    ["出発地", "", "⇒", DESTINATION, "", "", "", ""],
    ["", "", "", "", "", "", "", ""],
    [PAYMENT_SECTION, "", "", "", "", "", "", ""],
    ["入金予定日", "入金場所", "入金予定額", "入金日", PAYMENT_AMOUNT_HEADER, "備考", "チェック", ""],
    ["", "", "", "", "", "", "", ""],
    ["", "", "", "", "", "", "", ""],
    ["", "", "", "", "", "", "", ""],
    ["", "", "", "", "", "", "", ""],
    [PAYMENT_TOTAL, "", "", "", "", "", "", ""],
    ["", "", "", "", "", "", "", ""],
    [EXPENSE_SECTION, "", "", "", "", "", "", ""],
    ["利用日", "手配先名；該当に〇を付ける", "電話/FAX", "担当者", "支払予定日", EXPENSE_AMOUNT_HEADER, "チェック", ""],
    ["", "", "", "", "", "", "", ""],
    ["", "", "", "", "", "", "", ""],
    ["", "", "", "", "", "", "", ""],
    ["", "", "", "", "", "", "", ""],
    [EXPENSE_TOTAL, "", "", "", "", "", "", ""],
    ["", "", "", "", "", "", "", ""],
    [PROFIT_SECTION, "", "", "", "", "", "", ""],
    ["報告日", PROFIT_RATE_HEADER, PROFIT_HEADER, PER_PERSON_HEADER, TRAVEL_TOTAL_HEADER, EXPENSE_SUMMARY_HEADER, SUMMARY_PERSONS_HEADER, "特補人数"],
    ["", "", "", "", "", "", "", ""],
    ["", "", "", "", "", "", "", ""],
    [SUPERVISOR_CHECK, "何月/何日に利益申請", "", "", "", "", "", ""],
    ["", "", "", "", "", "", "", ""],
    ["", "", "", "", "", "", "", ""],
    ["", "", "", "", "", "", "", ""],
    ["", "", "", "", "", "", "", ""],
];

/// A blank karte.
pub fn blank_karte() -> Grid {
    Grid::from_rows(
        TEMPLATE
            .iter()
            .map(|row| row.iter().map(|cell| cell.to_string()).collect())
            .collect(),
    )
}

/// A rectangular merged area, anchored at its top-left cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedRegion {
    pub row: usize,
    pub col: usize,
    pub rowspan: usize,
    pub colspan: usize,
}

impl MergedRegion {
    fn row_span(row: usize, colspan: usize) -> Self {
        MergedRegion {
            row,
            col: 0,
            rowspan: 1,
            colspan,
        }
    }

    pub fn last_row(&self) -> usize {
        self.row + self.rowspan.max(1) - 1
    }

    pub fn last_col(&self) -> usize {
        self.col + self.colspan.max(1) - 1
    }
}

/// Merged regions for `grid`, located by their labels so they follow the
/// form when rows are inserted or removed.
pub fn merged_regions(grid: &Grid) -> Vec<MergedRegion> {
    let mut merges = Vec::new();

    let section = |label: &str, start: usize| grid.find_row_label(label, start);

    let basic = section(BASIC_SECTION, 0);
    if let Some(row) = basic {
        merges.push(MergedRegion::row_span(row, TEMPLATE_COLS));
    }
    if let Some(row) = section(TITLE, basic.unwrap_or(0)) {
        merges.push(MergedRegion::row_span(row, 2));
    }

    let payment = section(PAYMENT_SECTION, 0);
    if let Some(row) = payment {
        merges.push(MergedRegion::row_span(row, TEMPLATE_COLS));
        if let Some(total) = section(PAYMENT_TOTAL, row + 1) {
            merges.push(MergedRegion::row_span(total, TEMPLATE_COLS - 1));
        }
    }

    let expense = section(EXPENSE_SECTION, payment.map_or(0, |r| r + 1));
    if let Some(row) = expense {
        merges.push(MergedRegion::row_span(row, TEMPLATE_COLS));
        if let Some(total) = section(EXPENSE_TOTAL, row + 1) {
            merges.push(MergedRegion::row_span(total, TEMPLATE_COLS - 1));
        }
    }

    if let Some(row) = section(PROFIT_SECTION, expense.map_or(0, |r| r + 1)) {
        merges.push(MergedRegion::row_span(row, TEMPLATE_COLS));
        if let Some(check) = section(SUPERVISOR_CHECK, row + 1) {
            merges.push(MergedRegion::row_span(check, 2));
        }
    }

    merges
}
