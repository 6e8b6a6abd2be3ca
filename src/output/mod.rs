mod progress;
mod styling;
mod summary;
mod tables;

pub use progress::PhaseProgress;
pub use styling::{dim, magenta_bold};
pub use summary::{print_analysis, print_culprits, print_outcome, print_tick};

/// Prints the culprit-finder banner to stderr.
pub fn print_banner() {
    eprintln!(
        r"
{} {}
  {}
",
        magenta_bold("🔎 culprit-finder"),
        dim(env!("CARGO_PKG_VERSION")),
        dim("Finds the commits that broke your builds")
    );
}
