//! Terminal output helpers.

use colored::Colorize;

/// Section header: ">> Title" in cyan.
pub fn section(title: &str) {
    println!("  {} {}", ">>".bright_cyan().bold(), title.bold());
}

/// Key-value display: "  Label:       value".
pub fn kv(label: &str, value: &str) {
    println!("  {:<13}{}", format!("{label}:"), value);
}

/// Key-value with green value.
pub fn kv_ok(label: &str, value: &str) {
    println!("  {:<13}{}", format!("{label}:"), value.bright_green());
}

pub fn success(msg: &str) {
    println!("  {} {}", "\u{2714}".bright_green(), msg);
}

pub fn error(msg: &str) {
    println!("  {} {}", "\u{2718}".bright_red(), msg.bright_red());
}

/// Hint line: "  hint: message" in dimmed text.
pub fn hint(msg: &str) {
    println!("  {} {}", "hint:".dimmed(), msg.dimmed());
}

pub fn blank() {
    println!();
}
