//! Derived totals: payment and expense sums and the profit summary row.
//!
//! Every derived cell is located through the template's labels, so the
//! calculation keeps working after rows are inserted or removed. A missing
//! label only disables the cells that depend on it.

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use crate::error::RenderError;
use crate::grid::{ChangeSource, Grid, GridWidget};
use crate::template;

lazy_static! {
    static ref NUMBER: Regex = Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)$").unwrap();
}

/// Logical key of a computed cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DerivedCell {
    PaymentTotal,
    ExpenseTotal,
    ProfitRate,
    Profit,
    PerPersonProfit,
    TravelTotal,
    ExpenseSummary,
    Persons,
}

/// A block of line items with an amount column and a total row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineSection {
    pub amount_col: usize,
    pub first_row: usize,
    pub total_row: usize,
}

impl LineSection {
    fn locate(grid: &Grid, section: &str, header: &str, total: &str, from: usize) -> Option<Self> {
        let section_row = grid.find_row_label(section, from)?;
        let (header_row, amount_col) = grid.find_label_from(header, section_row)?;
        let total_row = grid.find_row_label(total, header_row + 1)?;
        Some(LineSection {
            amount_col,
            first_row: header_row + 1,
            total_row,
        })
    }

    fn sum(&self, grid: &Grid) -> f64 {
        (self.first_row..self.total_row)
            .map(|row| parse_amount(grid.get(row, self.amount_col)))
            .sum()
    }

    fn total_cell(&self) -> (usize, usize) {
        (self.total_row, self.amount_col)
    }
}

/// Columns of the profit summary row, each found under its header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SummaryRow {
    pub row: usize,
    pub rate: Option<usize>,
    pub profit: Option<usize>,
    pub per_person: Option<usize>,
    pub travel_total: Option<usize>,
    pub expense_total: Option<usize>,
    pub persons: Option<usize>,
}

impl SummaryRow {
    fn locate(grid: &Grid, from: usize) -> Option<Self> {
        let section_row = grid.find_row_label(template::PROFIT_SECTION, from)?;
        let (header_row, _) = grid.find_label_from(template::PROFIT_RATE_HEADER, section_row)?;
        let column = |label: &str| {
            grid.rows()
                .get(header_row)?
                .iter()
                .position(|cell| crate::grid::label_matches(cell, label))
        };
        Some(SummaryRow {
            row: header_row + 1,
            rate: column(template::PROFIT_RATE_HEADER),
            profit: column(template::PROFIT_HEADER),
            per_person: column(template::PER_PERSON_HEADER),
            travel_total: column(template::TRAVEL_TOTAL_HEADER),
            expense_total: column(template::EXPENSE_SUMMARY_HEADER),
            persons: column(template::SUMMARY_PERSONS_HEADER),
        })
    }
}

/// Where the derived cells of one grid live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Layout {
    pub payment: Option<LineSection>,
    pub expense: Option<LineSection>,
    pub summary: Option<SummaryRow>,
    /// The basic-info cell holding the number of travellers.
    pub person_count: Option<(usize, usize)>,
}

impl Layout {
    pub fn locate(grid: &Grid) -> Self {
        let payment = LineSection::locate(
            grid,
            template::PAYMENT_SECTION,
            template::PAYMENT_AMOUNT_HEADER,
            template::PAYMENT_TOTAL,
            0,
        );
        let after_payment = payment.map_or(0, |s| s.total_row + 1);
        let expense = LineSection::locate(
            grid,
            template::EXPENSE_SECTION,
            template::EXPENSE_AMOUNT_HEADER,
            template::EXPENSE_TOTAL,
            after_payment,
        );
        let summary = SummaryRow::locate(grid, expense.map_or(after_payment, |s| s.total_row + 1));
        let person_count = grid
            .find_label(template::PERSON_COUNT)
            .map(|(row, col)| (row, col + 1));

        Layout {
            payment,
            expense,
            summary,
            person_count,
        }
    }

    pub fn cell(&self, key: DerivedCell) -> Option<(usize, usize)> {
        let summary = |col: Option<usize>| Some((self.summary?.row, col?));
        match key {
            DerivedCell::PaymentTotal => self.payment.map(|s| s.total_cell()),
            DerivedCell::ExpenseTotal => self.expense.map(|s| s.total_cell()),
            DerivedCell::ProfitRate => summary(self.summary?.rate),
            DerivedCell::Profit => summary(self.summary?.profit),
            DerivedCell::PerPersonProfit => summary(self.summary?.per_person),
            DerivedCell::TravelTotal => summary(self.summary?.travel_total),
            DerivedCell::ExpenseSummary => summary(self.summary?.expense_total),
            DerivedCell::Persons => summary(self.summary?.persons),
        }
    }
}

/// Parse a cell as a number, ignoring thousands separators, currency marks
/// and whitespace. Anything else is `None`.
pub fn parse_number(text: &str) -> Option<f64> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '，' | '¥' | '円') && !c.is_whitespace())
        .collect();
    if !NUMBER.is_match(&cleaned) {
        return None;
    }
    cleaned.parse().ok().filter(|value: &f64| value.is_finite())
}

/// Blank and non-numeric cells count as zero.
pub fn parse_amount(text: &str) -> f64 {
    parse_number(text).unwrap_or(0.0)
}

/// Whole numbers print without a fraction; others keep at most two places.
pub fn format_amount(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    let text = format!("{value:.2}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// One decimal place and a percent sign; rates that round to zero print unsigned.
fn format_rate(rate: f64) -> String {
    let text = format!("{rate:.1}%");
    match text.as_str() {
        "-0.0%" => "0.0%".to_string(),
        _ => text,
    }
}

fn amount_or_blank(value: f64) -> String {
    if value == 0.0 {
        String::new()
    } else {
        format_amount(value)
    }
}

/// The computed figures of one grid.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Totals {
    pub payment: f64,
    pub expense: f64,
    pub persons: Option<f64>,
}

impl Totals {
    pub fn compute(grid: &Grid, layout: &Layout) -> Self {
        Totals {
            payment: layout.payment.map_or(0.0, |s| s.sum(grid)),
            expense: layout.expense.map_or(0.0, |s| s.sum(grid)),
            persons: layout
                .person_count
                .and_then(|(row, col)| parse_number(grid.get(row, col))),
        }
    }

    pub fn profit(&self) -> f64 {
        self.payment - self.expense
    }

    /// Target text of every derived cell; `None` leaves a cell untouched.
    pub fn value(&self, key: DerivedCell) -> Option<String> {
        let idle = self.payment == 0.0 && self.expense == 0.0;
        let persons = self.persons.filter(|p| *p > 0.0);
        let profit = self.profit();

        let text = match key {
            DerivedCell::PaymentTotal => amount_or_blank(self.payment),
            DerivedCell::ExpenseTotal => amount_or_blank(self.expense),
            DerivedCell::Persons => return persons.map(format_amount),
            _ if idle => String::new(),
            DerivedCell::ProfitRate if self.payment == 0.0 => String::new(),
            DerivedCell::ProfitRate => format_rate(profit / self.payment * 100.0),
            DerivedCell::Profit => amount_or_blank(profit),
            DerivedCell::PerPersonProfit => match persons {
                Some(p) => format!("{}", (profit / p).round() as i64),
                None => String::new(),
            },
            DerivedCell::TravelTotal => amount_or_blank(self.payment),
            DerivedCell::ExpenseSummary => amount_or_blank(self.expense),
        };
        Some(text)
    }
}

const DERIVED_CELLS: [DerivedCell; 8] = [
    DerivedCell::PaymentTotal,
    DerivedCell::ExpenseTotal,
    DerivedCell::ProfitRate,
    DerivedCell::Profit,
    DerivedCell::PerPersonProfit,
    DerivedCell::TravelTotal,
    DerivedCell::ExpenseSummary,
    DerivedCell::Persons,
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellUpdate {
    pub cell: DerivedCell,
    pub row: usize,
    pub col: usize,
    pub value: String,
}

/// Derived cells whose current text differs from the computed one.
pub fn updates(grid: &Grid) -> Vec<CellUpdate> {
    let layout = Layout::locate(grid);
    let totals = Totals::compute(grid, &layout);

    DERIVED_CELLS
        .iter()
        .filter_map(|&cell| {
            let (row, col) = layout.cell(cell)?;
            let value = totals.value(cell)?;
            (grid.get(row, col) != value).then_some(CellUpdate {
                cell,
                row,
                col,
                value,
            })
        })
        .collect()
}

/// `grid` with every derived cell brought up to date.
pub fn recalculate(grid: &Grid) -> Grid {
    let mut out = grid.clone();
    for update in updates(grid) {
        out.set(update.row, update.col, update.value);
    }
    out
}

/// Writes derived cells back into a live widget.
#[derive(Debug, Default)]
pub struct Recalculator {
    busy: bool,
}

impl Recalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Recalculate and write the changed cells, returning how many changed.
    /// Does nothing while a run is already in progress.
    pub fn run<W: GridWidget + ?Sized>(&mut self, widget: &mut W) -> Result<usize, RenderError> {
        if self.busy {
            debug!("recalculation already running; skipped");
            return Ok(0);
        }
        self.busy = true;
        let result = Self::write_updates(widget);
        self.busy = false;
        result
    }

    fn write_updates<W: GridWidget + ?Sized>(widget: &mut W) -> Result<usize, RenderError> {
        let grid = widget.read_grid()?;
        let pending = updates(&grid);
        for update in &pending {
            widget.set_cell(update.row, update.col, &update.value, ChangeSource::Recalc)?;
        }
        if !pending.is_empty() {
            debug!("recalculation updated {} cells", pending.len());
        }
        Ok(pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::MemoryGrid;
    use crate::template::blank_karte;

    // Template coordinates.
    const PAYMENT_TOTAL: (usize, usize) = (12, 4);
    const EXPENSE_TOTAL: (usize, usize) = (20, 5);
    const SUMMARY_ROW: usize = 24;

    fn with_amounts(payments: &[&str], expenses: &[&str]) -> Grid {
        let mut grid = blank_karte();
        for (i, amount) in payments.iter().enumerate() {
            grid.set(8 + i, 4, *amount);
        }
        for (i, amount) in expenses.iter().enumerate() {
            grid.set(16 + i, 5, *amount);
        }
        grid
    }

    #[test]
    fn numbers_ignore_separators_and_reject_text() {
        assert_eq!(parse_number("1,000"), Some(1000.0));
        assert_eq!(parse_number(" ¥12，500円 "), Some(12500.0));
        assert_eq!(parse_number("-3.5"), Some(-3.5));
        assert_eq!(parse_number(".5"), Some(0.5));
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number("1e3"), None);
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number(&"9".repeat(400)), None);
        assert_eq!(parse_amount(&"9".repeat(400)), 0.0);
        assert_eq!(format_amount(1500.0), "1500");
        assert_eq!(format_amount(0.1 + 0.2), "0.3");
    }

    #[test]
    fn oversized_amounts_count_as_zero() {
        let huge = "9".repeat(400);
        let grid = recalculate(&with_amounts(&[&huge, "500"], &[]));
        assert_eq!(grid.get(PAYMENT_TOTAL.0, PAYMENT_TOTAL.1), "500");
        assert_eq!(grid.get(SUMMARY_ROW, 1), "100.0%");
    }

    #[test]
    fn tiny_losses_print_an_unsigned_zero_rate() {
        let grid = recalculate(&with_amounts(&["100000"], &["1"]));
        assert_eq!(grid.get(SUMMARY_ROW, 1), "0.0%");
        assert_eq!(grid.get(SUMMARY_ROW, 2), "-1");
        assert_eq!(format_rate(-0.04), "0.0%");
        assert_eq!(format_rate(-0.05 - 1e-9), "-0.1%");
    }

    #[test]
    fn layout_is_found_by_labels() {
        let layout = Layout::locate(&blank_karte());
        assert_eq!(layout.cell(DerivedCell::PaymentTotal), Some(PAYMENT_TOTAL));
        assert_eq!(layout.cell(DerivedCell::ExpenseTotal), Some(EXPENSE_TOTAL));
        assert_eq!(layout.cell(DerivedCell::ProfitRate), Some((SUMMARY_ROW, 1)));
        assert_eq!(layout.cell(DerivedCell::Persons), Some((SUMMARY_ROW, 6)));
        assert_eq!(layout.person_count, Some((3, 5)));
    }

    #[test]
    fn payment_total_skips_blank_and_text() {
        let grid = recalculate(&with_amounts(&["1,000", "", "500", "abc"], &[]));
        assert_eq!(grid.get(PAYMENT_TOTAL.0, PAYMENT_TOTAL.1), "1500");
        assert_eq!(grid.get(EXPENSE_TOTAL.0, EXPENSE_TOTAL.1), "");
        assert_eq!(grid.get(SUMMARY_ROW, 1), "100.0%");
        assert_eq!(grid.get(SUMMARY_ROW, 2), "1500");
        assert_eq!(grid.get(SUMMARY_ROW, 4), "1500");
    }

    #[test]
    fn rate_is_blank_without_payments() {
        let grid = recalculate(&with_amounts(&[], &["200"]));
        assert_eq!(grid.get(PAYMENT_TOTAL.0, PAYMENT_TOTAL.1), "");
        assert_eq!(grid.get(EXPENSE_TOTAL.0, EXPENSE_TOTAL.1), "200");
        assert_eq!(grid.get(SUMMARY_ROW, 2), "-200");
        assert_eq!(grid.get(SUMMARY_ROW, 1), "");
    }

    #[test]
    fn per_person_profit_needs_a_person_count() {
        let mut grid = with_amounts(&["10000"], &["7000"]);
        assert_eq!(recalculate(&grid).get(SUMMARY_ROW, 3), "");

        grid.set(3, 5, "7");
        let grid = recalculate(&grid);
        assert_eq!(grid.get(SUMMARY_ROW, 1), "30.0%");
        assert_eq!(grid.get(SUMMARY_ROW, 3), "429");
        assert_eq!(grid.get(SUMMARY_ROW, 6), "7");

        let mut zero = grid.clone();
        zero.set(3, 5, "0");
        assert_eq!(recalculate(&zero).get(SUMMARY_ROW, 3), "");
    }

    #[test]
    fn clearing_every_amount_blanks_the_summary() {
        let filled = recalculate(&with_amounts(&["300"], &["100"]));
        assert_eq!(filled.get(SUMMARY_ROW, 2), "200");

        let mut cleared = filled.clone();
        cleared.set(8, 4, "");
        cleared.set(16, 5, "");
        let cleared = recalculate(&cleared);
        for col in 1..=5 {
            assert_eq!(cleared.get(SUMMARY_ROW, col), "", "column {col}");
        }
        assert_eq!(cleared.get(PAYMENT_TOTAL.0, PAYMENT_TOTAL.1), "");
    }

    #[test]
    fn recalculation_is_idempotent() {
        let mut inserted = with_amounts(&["1,200", "x"], &["50.5"]);
        inserted.insert_row(10);
        inserted.set(10, 4, "800");
        inserted.set(3, 5, "3");

        for grid in [
            blank_karte(),
            with_amounts(&["1,000", "", "500", "abc"], &[]),
            with_amounts(&[], &["200"]),
            inserted,
            Grid::new(3, 3),
        ] {
            let once = recalculate(&grid);
            assert_eq!(recalculate(&once), once);
            assert!(updates(&once).is_empty());
        }
    }

    #[test]
    fn inserted_rows_are_summed() {
        let mut grid = with_amounts(&["100"], &[]);
        grid.insert_row(9);
        grid.insert_row(9);
        grid.set(10, 4, "250");
        let grid = recalculate(&grid);
        assert_eq!(grid.get(14, 4), "350");
    }

    #[test]
    fn missing_labels_only_disable_their_cells() {
        let mut grid = with_amounts(&["100"], &["40"]);
        grid.set(20, 0, "");
        let out = recalculate(&grid);
        assert_eq!(out.get(PAYMENT_TOTAL.0, PAYMENT_TOTAL.1), "100");
        assert_eq!(out.get(EXPENSE_TOTAL.0, EXPENSE_TOTAL.1), "");
        assert_eq!(out.get(SUMMARY_ROW, 2), "100");
    }

    #[test]
    fn recalculator_writes_with_recalc_source_and_skips_when_busy() {
        let mut widget = MemoryGrid::new();
        widget.load_grid(with_amounts(&["900"], &[])).unwrap();
        widget.take_changes();

        let mut recalc = Recalculator::new();
        recalc.busy = true;
        assert_eq!(recalc.run(&mut widget).unwrap(), 0);
        recalc.busy = false;

        assert!(recalc.run(&mut widget).unwrap() > 0);
        assert!(!recalc.is_busy());
        let changes = widget.take_changes();
        assert!(changes.iter().all(|b| b.source == ChangeSource::Recalc));
        assert_eq!(recalc.run(&mut widget).unwrap(), 0);
        assert!(widget.take_changes().is_empty());
    }
}
