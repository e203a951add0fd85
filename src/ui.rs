//! Operator-facing console output

use colored::*;

pub fn section(title: &str) {
    println!();
    println!("{}", format!("━━ {}", title).bold());
}

pub fn step(message: &str) {
    println!("  {}", message);
}

pub fn success(message: &str) {
    println!("{}", success_line(message));
}

/// Non-fatal problem; the run continues
pub fn warn(message: &str) {
    eprintln!("{}", warn_line(message));
}

/// Fatal problem; the caller exits non-zero afterwards
pub fn fatal(message: &str) {
    eprintln!("{}", fatal_line(message));
}

fn success_line(message: &str) -> String {
    format!("  {} {}", "✓".green(), message)
}

fn warn_line(message: &str) -> String {
    format!("{} {}", "⚠".yellow(), message.yellow())
}

fn fatal_line(message: &str) -> String {
    format!("{} {}", "✗".red(), message.red())
}
