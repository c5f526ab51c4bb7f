//! Parsers for list-shaped payloads.
//!
//! The agent returns listings as a single string value: one record per line,
//! fields separated by tabs.

/// A bean registered in the target's application context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeanInfo {
    pub name: String,
    pub class_name: String,
}

/// Parses a `list-beans` value. Blank lines are skipped; a missing class
/// column yields an empty class name.
pub fn parse_bean_listing(value: &str) -> Vec<BeanInfo> {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let mut parts = line.split('\t');
            let name = parts.next().unwrap_or_default().trim().to_string();
            let class_name = parts.next().unwrap_or_default().trim().to_string();
            BeanInfo { name, class_name }
        })
        .collect()
}

/// Parses a `snapshot-list-simple` value into its non-blank lines.
pub fn parse_snapshot_listing(value: &str) -> Vec<String> {
    value
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}
