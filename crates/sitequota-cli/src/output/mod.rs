//! Output formatting module
//!
//! Provides table and JSON output formatting for CLI commands.

use colored::{ColoredString, Colorize};
use serde::Serialize;
use sitequota_core::services::quota::{Presentation, Urgency};
use std::fmt::Display;
use tabled::{Table, Tabled};

/// Output format enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {}. Use 'table' or 'json'", s)),
        }
    }
}

impl Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Print data in the specified format
pub fn print_output<T>(data: &[T], format: OutputFormat) -> anyhow::Result<()>
where
    T: Serialize + Tabled,
{
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("No items found.");
            } else {
                let table = Table::new(data).to_string();
                println!("{}", table);
            }
        }
        OutputFormat::Json => print_json(data)?,
    }
    Ok(())
}

/// Print a single item in the specified format
pub fn print_single<T>(data: &T, format: OutputFormat) -> anyhow::Result<()>
where
    T: Serialize + Tabled,
{
    match format {
        OutputFormat::Table => {
            let table = Table::new([data]).to_string();
            println!("{}", table);
        }
        OutputFormat::Json => print_json(data)?,
    }
    Ok(())
}

/// Print any serializable value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(data: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(data)?;
    println!("{}", json);
    Ok(())
}

/// Print a success message (respects quiet mode)
pub fn print_success(message: &str, quiet: bool) {
    if !quiet {
        println!("{}", message.green());
    }
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{}", message.red());
}

/// Print an info message (respects quiet mode)
pub fn print_info(message: &str, quiet: bool) {
    if !quiet {
        println!("{}", message);
    }
}

/// Headline of a view, colored by how urgent it is
pub fn styled_headline(view: &Presentation) -> ColoredString {
    let text = view.headline();
    match view {
        Presentation::Full { urgency, .. } => match urgency {
            Urgency::Calm => text.blue(),
            Urgency::Warning => text.yellow(),
            Urgency::Critical => text.red(),
        },
        Presentation::Bonus { urgency, .. } => match urgency {
            Urgency::Calm => text.green(),
            Urgency::Warning => text.yellow(),
            Urgency::Critical => text.red(),
        },
        Presentation::Blocked { .. } => text.red().bold(),
        Presentation::Error { .. } => text.red(),
    }
}

/// Milliseconds as `M:SS`, or `-` when absent
pub fn countdown_cell(ms: Option<i64>) -> String {
    ms.map(sitequota_core::services::quota::format_countdown)
        .unwrap_or_else(|| "-".to_string())
}
