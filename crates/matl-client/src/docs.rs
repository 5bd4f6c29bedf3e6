//! Searching the function reference.
//!
//! MATL function names are one or two characters (two when prefixed with
//! `X`, `Y` or `Z`), so a query that looks like a function name only matches
//! the `source` column, case-sensitively. Anything else is a free-text
//! search over every column.

use std::sync::OnceLock;

use regex::Regex;

use crate::protocol::HelpEntry;

/// Whether `query` should be matched against function names only.
pub fn is_source_query(query: &str) -> bool {
    let len = query.chars().count();
    len == 1 || (len == 2 && query.starts_with(['X', 'Y', 'Z']))
}

fn html_tag() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"<[^>]*>").expect("valid regex"))
}

/// Text a free-text search looks at. Descriptions contain markup, which is
/// not searchable.
fn searchable_text(entry: &HelpEntry) -> String {
    let description = html_tag().replace_all(&entry.description, " ");
    format!(
        "{} {} {} {}",
        entry.source, entry.arguments, entry.brief, description
    )
    .to_lowercase()
}

/// Whether `entry` matches `query`.
pub fn matches(entry: &HelpEntry, query: &str) -> bool {
    if query.is_empty() {
        return true;
    }

    if is_source_query(query) {
        // A lone double quote is written doubled in MATL source.
        let needle = if query.matches('"').count() == 1 {
            query.replace('"', "\"\"")
        } else {
            query.to_string()
        };
        return entry.source.contains(&needle);
    }

    let haystack = searchable_text(entry);
    query
        .split_whitespace()
        .all(|term| haystack.contains(&term.to_lowercase()))
}

/// Entries matching `query`, in their original order.
pub fn search<'a>(entries: &'a [HelpEntry], query: &str) -> Vec<&'a HelpEntry> {
    entries.iter().filter(|entry| matches(entry, query)).collect()
}
