//! Terminal output helpers shared by the commands.

use owo_colors::OwoColorize;

#[derive(Debug, Clone, Copy, Default)]
pub struct Output {
    quiet: bool,
}

impl Output {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    pub fn print(&self, line: &str) {
        if !self.quiet {
            println!("{}", line);
        }
    }

    pub fn section(&self, title: &str) {
        if !self.quiet {
            println!("{}", title.bold().underline());
        }
    }

    pub fn info(&self, icon: &str, message: &str) {
        if !self.quiet {
            println!("{} {}", icon, message);
        }
    }

    pub fn status(&self, message: &str) {
        if !self.quiet {
            println!("  {}", message.dimmed());
        }
    }

    /// Aligned `label: value` line.
    pub fn kv(&self, label: &str, value: &str) {
        if !self.quiet {
            println!("  {:<14} {}", format!("{}:", label).bright_black(), value);
        }
    }

    pub fn success(&self, message: &str) {
        if !self.quiet {
            println!("{} {}", "✓".green(), message);
        }
    }

    pub fn warning(&self, message: &str) {
        eprintln!("{} {}", "!".yellow().bold(), message.yellow());
    }
}
