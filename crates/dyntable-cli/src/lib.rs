//! Shared CLI definitions for dyntable.
//!
//! Used by the main application and by the build script (manpage) and
//! gen_docs binary (command-line-options markdown).

use clap::{CommandFactory, Parser, ValueEnum};
use std::path::PathBuf;

/// Aggregate function applied to every selected metric column
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum AggregateArg {
    /// SUM of the metric column
    Sum,
    /// AVG of the metric column
    Average,
    /// COUNT of the metric column
    Count,
    /// COUNT_DISTINCT of the metric column
    CountDistinct,
    /// MIN of the metric column
    Min,
    /// MAX of the metric column
    Max,
}

impl AggregateArg {
    /// Display name as shown in the aggregate selector ("Count Distinct", ...)
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Sum => "Sum",
            Self::Average => "Average",
            Self::Count => "Count",
            Self::CountDistinct => "Count Distinct",
            Self::Min => "Min",
            Self::Max => "Max",
        }
    }
}

/// Command-line arguments for dyntable
#[derive(Clone, Parser, Debug)]
#[command(
    name = "dyntable",
    version,
    about = "Reconfigurable aggregate tables in the terminal"
)]
pub struct Args {
    /// Path to the chart form data (JSON) describing the datasource and selectable columns
    /// (not required with --generate-config or --clear-cache)
    #[arg(required_unless_present_any = ["generate_config", "clear_cache"], value_name = "FORM_DATA")]
    pub form_data: Option<PathBuf>,

    /// Host (and optional port) of the analytical query service, e.g. localhost:8088
    #[arg(long = "host", value_name = "HOST")]
    pub host: Option<String>,

    /// Protocol used to reach the query service (http or https)
    #[arg(long = "protocol", value_name = "PROTOCOL")]
    pub protocol: Option<String>,

    /// Query endpoint path relative to the host (default: api/v1/chart/data)
    #[arg(long = "endpoint", value_name = "PATH")]
    pub endpoint: Option<String>,

    /// Request timeout in seconds
    #[arg(long = "timeout", value_name = "SECS")]
    pub timeout_secs: Option<u64>,

    /// Group-by column to select initially (repeatable; overrides the form data defaults)
    #[arg(long = "group-by", value_name = "COLUMN")]
    pub group_by: Vec<String>,

    /// Metric column to select initially (repeatable; overrides the form data defaults)
    #[arg(long = "metric", value_name = "COLUMN")]
    pub metrics: Vec<String>,

    /// Aggregate function applied to all metric columns
    #[arg(long = "aggregate", value_enum)]
    pub aggregate: Option<AggregateArg>,

    /// Align cell bars on zero and scale them by absolute value
    #[arg(long = "align-positive-negative", value_name = "BOOL", value_parser = clap::value_parser!(bool))]
    pub align_positive_negative: Option<bool>,

    /// Color negative cell bars differently from positive ones
    #[arg(long = "color-positive-negative", value_name = "BOOL", value_parser = clap::value_parser!(bool))]
    pub color_positive_negative: Option<bool>,

    /// Render proportional cell bars behind numeric metric cells
    #[arg(long = "cell-bars", value_name = "BOOL", value_parser = clap::value_parser!(bool))]
    pub show_cell_bars: Option<bool>,

    /// Emit cross filters when a dimension cell is selected
    #[arg(long = "cross-filters", value_name = "BOOL", value_parser = clap::value_parser!(bool))]
    pub emit_cross_filters: Option<bool>,

    /// Rows per page (0 shows all rows)
    #[arg(long = "page-size", value_name = "N")]
    pub page_size: Option<usize>,

    /// Enable debug mode to show operational information and verbose logging
    #[arg(long = "debug", action)]
    pub debug: bool,

    /// Write the default configuration file and exit
    #[arg(long = "generate-config", action)]
    pub generate_config: bool,

    /// Overwrite an existing configuration file (with --generate-config)
    #[arg(long = "force", action, requires = "generate_config")]
    pub force: bool,

    /// Clear all cache data (including logs) and exit
    #[arg(long = "clear-cache", action)]
    pub clear_cache: bool,
}

/// Escape `|` and newlines for use in markdown table cells.
fn escape_table_cell(s: &str) -> String {
    s.replace('|', "\\|").replace(['\n', '\r'], " ")
}

fn value_placeholder(arg: &clap::Arg) -> String {
    arg.get_value_names()
        .map(|names| {
            names
                .iter()
                .map(|n: &clap::builder::Str| format!("<{}>", n.as_ref() as &str))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

/// Render command-line options as markdown.
pub fn render_options_markdown() -> String {
    let mut cmd = Args::command();
    cmd.build();

    let mut out = String::from("# Command Line Options\n\n");

    out.push_str("## Usage\n\n```\n");
    out.push_str(&cmd.render_usage().to_string());
    out.push_str("\n```\n\n");

    out.push_str("## Options\n\n");
    out.push_str("| Option | Description |\n");
    out.push_str("|--------|-------------|\n");

    for arg in cmd.get_arguments() {
        let id = arg.get_id().as_ref().to_string();
        if id == "help" || id == "version" {
            continue;
        }

        let option_str = if arg.is_positional() {
            let placeholder = value_placeholder(arg);
            if arg.is_required_set() {
                placeholder
            } else {
                format!("[{placeholder}]")
            }
        } else {
            let mut parts = Vec::new();
            if let Some(s) = arg.get_short() {
                parts.push(format!("-{s}"));
            }
            if let Some(l) = arg.get_long() {
                parts.push(format!("--{l}"));
            }
            let op = parts.join(", ");
            let placeholder = if arg.get_action().takes_values() {
                value_placeholder(arg)
            } else {
                String::new()
            };
            if placeholder.is_empty() {
                op
            } else {
                format!("{op} {placeholder}")
            }
        };

        let help = arg
            .get_help()
            .map(|h| escape_table_cell(&h.to_string()))
            .unwrap_or_else(|| "-".to_string());

        out.push_str(&format!("| `{option_str}` | {help} |\n"));
    }

    out
}
