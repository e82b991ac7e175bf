use colored::Colorize;

/// Success line with a green status dot.
pub fn success(msg: &str) {
    println!("  {} {msg}", "●".green());
}

/// Dimmed line for work that was skipped.
pub fn skipped(msg: &str) {
    println!("  {} {}", "○".dimmed(), msg.dimmed());
}

/// Failure line on stderr with a red status dot.
pub fn failure(msg: &str) {
    eprintln!("  {} {}", "●".red(), msg.red());
}
