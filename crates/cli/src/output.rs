//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use wgledger_common::{ConnectionStatus, UserStatus};

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
    /// Plain text format
    Plain,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

fn table_for<'a, T: TableDisplay + 'a>(items: impl IntoIterator<Item = &'a T>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(T::headers());
    for item in items {
        table.add_row(item.row());
    }
    table
}

fn plain_lines<T: TableDisplay>(item: &T) -> String {
    T::headers()
        .iter()
        .zip(item.row())
        .map(|(header, value)| format!("{}: {}", header, value))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a single item
pub fn render_item<T: Serialize + TableDisplay>(item: &T, format: OutputFormat) -> String {
    match format {
        OutputFormat::Table => table_for(std::iter::once(item)).to_string(),
        OutputFormat::Json => serde_json::to_string_pretty(item).unwrap_or_default(),
        OutputFormat::Yaml => serde_yaml::to_string(item).unwrap_or_default(),
        OutputFormat::Plain => plain_lines(item),
    }
}

/// Render a list of items
pub fn render_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) -> String {
    match format {
        OutputFormat::Table if items.is_empty() => "No items found.".to_string(),
        OutputFormat::Plain if items.is_empty() => "No items found.".to_string(),
        OutputFormat::Table => table_for(items).to_string(),
        OutputFormat::Json => serde_json::to_string_pretty(items).unwrap_or_default(),
        OutputFormat::Yaml => serde_yaml::to_string(items).unwrap_or_default(),
        OutputFormat::Plain => items
            .iter()
            .map(plain_lines)
            .collect::<Vec<_>>()
            .join("\n---\n"),
    }
}

/// Print a single item
pub fn print_item<T: Serialize + TableDisplay>(item: &T, format: OutputFormat) {
    println!("{}", render_item(item, format));
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    println!("{}", render_list(items, format));
}

/// Print a simple message
pub fn print_message(message: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "message": message }));
        }
        _ => {
            println!("{}", message);
        }
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    eprintln!("⚠️  {}", message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("ℹ️  {}", message);
}

/// Account status for table cells
pub fn user_status_cell(status: UserStatus) -> String {
    match status {
        UserStatus::Active => "active".green().to_string(),
        UserStatus::Inactive => "inactive".dimmed().to_string(),
        UserStatus::Expired => "expired".red().to_string(),
    }
}

/// Connection status for table cells
pub fn connection_status_cell(status: ConnectionStatus) -> String {
    match status {
        ConnectionStatus::Active => "● online".green().to_string(),
        ConnectionStatus::Inactive => "○ offline".dimmed().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Row {
        name: String,
        count: u32,
    }

    impl TableDisplay for Row {
        fn headers() -> Vec<&'static str> {
            vec!["Name", "Count"]
        }

        fn row(&self) -> Vec<String> {
            vec![self.name.clone(), self.count.to_string()]
        }
    }

    fn rows() -> Vec<Row> {
        vec![
            Row {
                name: "alice".to_string(),
                count: 1,
            },
            Row {
                name: "bob".to_string(),
                count: 2,
            },
        ]
    }

    #[test]
    fn test_plain_list() {
        assert_eq!(
            render_list(&rows(), OutputFormat::Plain),
            "Name: alice\nCount: 1\n---\nName: bob\nCount: 2"
        );
    }

    #[test]
    fn test_json_and_yaml() {
        let json = render_list(&rows(), OutputFormat::Json);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[1]["name"], "bob");

        let yaml = render_item(&rows()[0], OutputFormat::Yaml);
        assert!(yaml.contains("name: alice"));
        assert!(yaml.contains("count: 1"));
    }

    #[test]
    fn test_empty_list() {
        let empty: Vec<Row> = Vec::new();
        assert_eq!(render_list(&empty, OutputFormat::Table), "No items found.");
        assert_eq!(render_list(&empty, OutputFormat::Json), "[]");
    }

    #[test]
    fn test_table_contains_cells() {
        let table = render_list(&rows(), OutputFormat::Table);
        assert!(table.contains("Name"));
        assert!(table.contains("alice"));
        assert!(table.contains("bob"));
    }
}
