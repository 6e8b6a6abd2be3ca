use std::fmt::Write;

use comfy_table::Cell;

use crate::analysis::{AnalyzeOutcome, TickReport};
use crate::model::{AnalysisStatus, AtomicFailure, Culprit, FailureAnalysis, RerunBuild};

use super::styling::{bright, bright_green, bright_red, bright_yellow, cyan, dim};
use super::tables::{analysis_status_cell, create_table, cyan_header, rerun_status_cell};

/// Prints a human-readable summary of an `analyze` run to stdout.
pub fn print_outcome(outcome: &AnalyzeOutcome) {
    println!("{}", render_outcome(outcome));
}

/// Prints what one bisection tick did: culprits found, reruns in flight,
/// ranges still open and errors.
pub fn print_tick(report: &TickReport) {
    println!("{}", render_tick(report));
}

/// Prints an analysis with its failures, rerun builds and culprits.
pub fn print_analysis(
    analysis: &FailureAnalysis,
    failures: &[AtomicFailure],
    reruns: &[RerunBuild],
    culprits: &[Culprit],
) {
    println!("{}", render_analysis(analysis, failures, reruns, culprits));
}

pub fn print_culprits(culprits: &[Culprit]) {
    println!("{}", render_culprits(culprits));
}

fn add_section_header(output: &mut String, emoji: &str, title: &str) {
    let _ = writeln!(output, "{} {}", bright(emoji), bright(title).underlined());
}

fn styled_status(status: AnalysisStatus) -> String {
    let text = format!("{status:?}").to_uppercase();
    match status {
        AnalysisStatus::Completed => bright_green(text).to_string(),
        AnalysisStatus::Running => bright_yellow(text).to_string(),
        AnalysisStatus::Error => bright_red(text).to_string(),
    }
}

fn render_outcome(outcome: &AnalyzeOutcome) -> String {
    match outcome {
        AnalyzeOutcome::NoFirstFailures { build_id } => format!(
            "  {} {}\n",
            dim("No failure started in build"),
            cyan(build_id)
        ),
        AnalyzeOutcome::AllGrouped { build_id, groups } => {
            let groups: Vec<String> = groups.iter().map(ToString::to_string).collect();
            format!(
                "  {} {} {} {}\n",
                dim("Failures of build"),
                cyan(build_id),
                dim("are already analyzed by build(s)"),
                cyan(groups.join(", "))
            )
        }
        AnalyzeOutcome::Finished {
            analysis_id,
            status,
        } => format!(
            "  {} {} {}\n",
            dim("Analysis"),
            cyan(analysis_id),
            styled_status(*status)
        ),
        AnalyzeOutcome::Analyzing(report) => render_tick(report),
    }
}

fn render_tick(report: &TickReport) -> String {
    let mut output = String::new();

    add_section_header(&mut output, "🧭", "Bisection");
    let _ = writeln!(
        output,
        "  {} {}\n  {} {}\n",
        dim("Analysis:"),
        cyan(report.analysis_id),
        dim("Status:"),
        styled_status(report.status)
    );

    if !report.culprits.is_empty() {
        output.push_str(&render_culprits(&report.culprits));
    }

    if !report.open_ranges.is_empty() {
        add_section_header(&mut output, "🔍", "Open ranges");
        let mut table = create_table();
        table.set_header(cyan_header(&["Failures", "Range", "Width"]));
        for (keys, range) in &report.open_ranges {
            let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
            table.add_row(vec![
                Cell::new(keys.join(", ")),
                Cell::new(range),
                Cell::new(range.width()),
            ]);
        }
        let _ = writeln!(output, "{table}\n");
    }

    if !report.reruns.is_empty() {
        let positions: Vec<String> = report.reruns.iter().map(ToString::to_string).collect();
        let _ = writeln!(
            output,
            "  {} {}\n",
            dim("Reruns in flight at:"),
            bright_yellow(positions.join(", "))
        );
    }

    if !report.errors.is_empty() {
        add_section_header(&mut output, "⚠️", "Errors");
        for error in &report.errors {
            let _ = writeln!(output, "  {}", bright_red(error));
        }
        output.push('\n');
    }

    output
}

fn render_analysis(
    analysis: &FailureAnalysis,
    failures: &[AtomicFailure],
    reruns: &[RerunBuild],
    culprits: &[Culprit],
) -> String {
    let mut output = String::new();

    add_section_header(&mut output, "📋", "Analysis");
    let mut table = create_table();
    table.add_row(vec![Cell::new("Id"), Cell::new(analysis.id)]);
    table.add_row(vec![Cell::new("Kind"), Cell::new(analysis.kind)]);
    table.add_row(vec![
        Cell::new("Build"),
        Cell::new(format!("{} ({})", analysis.build_id, analysis.builder)),
    ]);
    table.add_row(vec![Cell::new("Repository"), Cell::new(analysis.repo.url())]);
    table.add_row(vec![
        Cell::new("Regression range"),
        Cell::new(format!(
            "({}, {}]",
            analysis.last_passed_commit, analysis.first_failed_commit
        )),
    ]);
    table.add_row(vec![Cell::new("Status"), analysis_status_cell(analysis.status)]);
    if let Some(error) = &analysis.error {
        table.add_row(vec![Cell::new("Error"), Cell::new(error)]);
    }
    let _ = writeln!(output, "{table}\n");

    if !failures.is_empty() {
        add_section_header(&mut output, "💥", "Failures");
        let mut table = create_table();
        table.set_header(cyan_header(&["Key", "Step", "Targets/Tests", "Culprit"]));
        for failure in failures {
            table.add_row(vec![
                Cell::new(failure.key),
                Cell::new(&failure.step_name),
                Cell::new(&failure.identifier),
                Cell::new(
                    failure
                        .culprit_commit_key
                        .as_ref()
                        .map_or_else(|| "-".to_string(), ToString::to_string),
                ),
            ]);
        }
        let _ = writeln!(output, "{table}\n");
    }

    if !reruns.is_empty() {
        add_section_header(&mut output, "🔁", "Rerun builds");
        let mut table = create_table();
        table.set_header(cyan_header(&["Build", "Commit", "Status", "Failed steps"]));
        for rerun in reruns {
            let steps: Vec<&str> = rerun.failures.keys().map(String::as_str).collect();
            table.add_row(vec![
                Cell::new(rerun.build_id),
                Cell::new(&rerun.commit),
                rerun_status_cell(rerun.status),
                Cell::new(steps.join(", ")),
            ]);
        }
        let _ = writeln!(output, "{table}\n");
    }

    if !culprits.is_empty() {
        output.push_str(&render_culprits(culprits));
    }

    output
}

fn render_culprits(culprits: &[Culprit]) -> String {
    let mut output = String::new();
    add_section_header(&mut output, "🎯", "Culprits");

    if culprits.is_empty() {
        let _ = writeln!(output, "  {}\n", dim("None found yet"));
        return output;
    }

    let mut table = create_table();
    table.set_header(cyan_header(&["Commit", "Position", "Repository", "Failures"]));
    for culprit in culprits {
        table.add_row(vec![
            Cell::new(&culprit.commit.gitiles_id),
            Cell::new(culprit.commit.commit_position),
            Cell::new(culprit.repo.url()),
            Cell::new(culprit.failure_keys.len()),
        ]);
    }
    let _ = writeln!(output, "{table}\n");
    output
}
