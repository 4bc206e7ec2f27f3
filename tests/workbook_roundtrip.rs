use karte::codec::{build_workbook, parse_workbook};
use karte::template::{blank_karte, merged_regions};
use karte::totals::recalculate;

#[test]
fn filled_karte_round_trips_modulo_padding() {
    let mut grid = blank_karte();
    grid.set(1, 3, "田中");
    grid.set(3, 5, "4");
    grid.set(8, 4, "120000");
    grid.set(9, 4, "1,500");
    grid.set(16, 5, "80000.5");
    grid.insert_row(10);
    grid.set(10, 4, "-200");
    let grid = recalculate(&grid);

    let bytes = build_workbook(&grid, &merged_regions(&grid)).expect("build");
    let parsed = parse_workbook(&bytes).expect("parse");
    assert!(parsed.same_content(&grid));

    let rebuilt = build_workbook(&parsed, &merged_regions(&parsed)).expect("rebuild");
    let reparsed = parse_workbook(&rebuilt).expect("reparse");
    assert!(reparsed.same_content(&grid));
    assert_eq!(reparsed.get(13, 4), grid.get(13, 4));
}

#[test]
fn sheet_starting_below_a1_keeps_positions() {
    let mut grid = karte::Grid::default();
    grid.set(4, 2, "offset");
    grid.set(6, 3, "42");

    let parsed = parse_workbook(&build_workbook(&grid, &[]).expect("build")).expect("parse");
    assert_eq!(parsed.get(4, 2), "offset");
    assert_eq!(parsed.get(6, 3), "42");
    assert_eq!(parsed.get(0, 0), "");
}

#[test]
fn empty_sheet_is_rejected() {
    let bytes = build_workbook(&karte::Grid::default(), &[]).expect("build");
    assert!(parse_workbook(&bytes).is_err());
}
