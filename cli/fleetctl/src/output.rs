//! Output formatting for CLI commands.

use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

const CLI_SCHEMA_VERSION: &str = "fleet.cli.v1";

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

impl OutputFormat {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Table,
        }
    }
}

/// Rows as a table, or as a JSON array.
pub fn print_output<T: Serialize + Tabled>(rows: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", format_json(rows, "[]")),
        OutputFormat::Table if rows.is_empty() => println!("{}", "Nothing to show.".dimmed()),
        OutputFormat::Table => println!("{}", Table::new(rows)),
    }
}

/// One structured result; always JSON.
pub fn print_single<T: Serialize>(data: &T) {
    println!("{}", format_json(data, "{}"));
}

pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "Warning:".yellow().bold(), message);
}

/// Wraps `data` in the versioned envelope scripts parse. Object keys come
/// out sorted since serde_json maps are ordered.
fn format_json<T: Serialize + ?Sized>(data: &T, fallback: &str) -> String {
    let envelope = serde_json::json!({
        "schemaVersion": CLI_SCHEMA_VERSION,
        "data": serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
    });
    serde_json::to_string_pretty(&envelope).unwrap_or_else(|_| fallback.to_string())
}
