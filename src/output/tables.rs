use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color as TableColor, ContentArrangement, Table};

use crate::model::{AnalysisStatus, BuildStatus};

/// Table and cell creation helpers
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn cyan_header(labels: &[&str]) -> Vec<Cell> {
    labels
        .iter()
        .map(|label| Cell::new(*label).fg(TableColor::Cyan))
        .collect()
}

pub fn analysis_status_cell(status: AnalysisStatus) -> Cell {
    let text = format!("{status:?}").to_uppercase();
    match status {
        AnalysisStatus::Completed => Cell::new(text).fg(TableColor::Green),
        AnalysisStatus::Running => Cell::new(text).fg(TableColor::Yellow),
        AnalysisStatus::Error => Cell::new(text).fg(TableColor::Red),
    }
}

/// Passed reruns are green, reproducing reruns red, pending or unusable ones
/// yellow.
pub fn rerun_status_cell(status: BuildStatus) -> Cell {
    let text = format!("{status:?}");
    match status {
        BuildStatus::Success => Cell::new(text).fg(TableColor::Green),
        BuildStatus::Failure => Cell::new(text).fg(TableColor::Red),
        _ => Cell::new(text).fg(TableColor::Yellow),
    }
}
