//! Output formatting utilities

use anyhow::Result;
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table from a list of items
pub fn print_table<T: Tabled>(items: &[T]) {
    if items.is_empty() {
        println!("{}", "No items found".yellow());
        return;
    }
    let table = Table::new(items).with(Style::rounded()).to_string();
    println!("{}", table);
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a section heading
pub fn print_heading(title: &str) {
    println!("{}", title.bold());
    println!("{}", "=".repeat(60));
}

/// Print an aligned `key: value` line
pub fn print_field(key: &str, value: impl std::fmt::Display) {
    println!("{:<22} {}", format!("{key}:"), value);
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format confidence as percentage
pub fn format_confidence(confidence: f32) -> String {
    format!("{:.0}%", confidence * 100.0)
}

/// Color confidence based on value
pub fn color_confidence(confidence: f32) -> String {
    let formatted = format_confidence(confidence);
    if confidence >= 0.8 {
        formatted.green().to_string()
    } else if confidence >= 0.6 {
        formatted.yellow().to_string()
    } else {
        formatted.red().to_string()
    }
}

/// Color a health or run status
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "healthy" | "completed" | "queued" => status.green().to_string(),
        "degraded" | "stopped_early" | "interrupted" | "not_requested" => {
            status.yellow().to_string()
        }
        "unhealthy" | "failed" | "rejected" => status.red().to_string(),
        _ => status.to_string(),
    }
}

/// Color a congestion label by severity code
pub fn color_congestion(code: u8, label: &str) -> String {
    match code {
        0 => label.green().to_string(),
        1 => label.cyan().to_string(),
        2 => label.yellow().to_string(),
        _ => label.red().bold().to_string(),
    }
}

pub fn format_float(value: f64) -> String {
    if value.abs() >= 1000.0 {
        format!("{:.1}", value)
    } else {
        format!("{:.4}", value)
    }
}
