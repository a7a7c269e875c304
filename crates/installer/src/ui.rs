//! Console output helpers for the deployment CLI.
//!
//! Provides consistent formatting for step headers, leveled messages, and
//! the final summary table.

use colored::Colorize;

/// Print the Forge Lab banner.
pub fn print_banner() {
    println!();
    println!(
        "{}",
        r"
  ______                       _          _
 |  ____|                     | |        | |
 | |__ ___  _ __ __ _  ___    | |     __ _| |__
 |  __/ _ \| '__/ _` |/ _ \   | |    / _` | '_ \
 | | | (_) | | | (_| |  __/   | |___| (_| | |_) |
 |_|  \___/|_|  \__, |\___|   |______\__,_|_.__/
                 __/ |
                |___/
"
        .cyan()
    );
    println!("  {}", "GPU Lab Cluster Provisioning".bright_black());
    println!();
}

/// Print a phase header.
pub fn print_phase(current: usize, total: usize, title: &str) {
    println!();
    println!("{}", "─".repeat(70).bright_black());
    println!(
        "{} {} {}",
        format!("[{current}/{total}]").bright_black(),
        "▶".cyan(),
        title.cyan().bold()
    );
    println!("{}", "─".repeat(70).bright_black());
}

/// Print a step indicator with message.
pub fn print_step(message: &str) {
    println!("{} {}", "▶".cyan(), message.bold());
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    println!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key}:").bright_black(), value);
}

/// Print a planned-but-not-executed action (dry run).
pub fn print_planned(action: &str) {
    println!("  {} {action}", "·".bright_black());
}

/// Print a fixed-width table.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() && cell.len() > widths[i] {
                widths[i] = cell.len();
            }
        }
    }

    let header_line = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{h:<width$}", width = widths[i]))
        .collect::<Vec<_>>()
        .join("  ");
    println!("  {}", header_line.bold());
    println!(
        "  {}",
        widths
            .iter()
            .map(|w| "─".repeat(*w))
            .collect::<Vec<_>>()
            .join("  ")
            .bright_black()
    );

    for row in rows {
        let line = row
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{cell:<width$}", width = widths.get(i).copied().unwrap_or(0)))
            .collect::<Vec<_>>()
            .join("  ");
        println!("  {line}");
    }
}
