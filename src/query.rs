//! Shared pieces of the per-model `get_many` queries: pagination arithmetic,
//! the conditional WHERE builder and the search-mode switch.

use rusqlite::types::Value;
use serde::Serialize;

/// Queries longer than this many characters use the full-text index.
pub const SUBSTRING_SEARCH_MAX_CHARS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub total_items: i64,
    pub total_pages: i64,
    pub items_per_page: i64,
    pub current_page: i64,
    pub previous_page: Option<i64>,
    pub next_page: Option<i64>,
}

impl Pagination {
    pub fn new(total_items: i64, items_per_page: i64, page: i64) -> Self {
        let total_items = total_items.max(0);
        let items_per_page = items_per_page.max(1);
        let total_pages = (total_items + items_per_page - 1) / items_per_page;
        let current_page = page.max(1);

        Self {
            total_items,
            total_pages,
            items_per_page,
            current_page,
            previous_page: (current_page > 1).then(|| current_page - 1),
            next_page: (current_page < total_pages).then(|| current_page + 1),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.current_page - 1) * self.items_per_page
    }

    pub fn limit(&self) -> i64 {
        self.items_per_page
    }
}

/// Conditions joined with `AND`, with their positional parameters in order.
#[derive(Debug, Default)]
pub struct Filter {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, clause: impl Into<String>, params: impl IntoIterator<Item = Value>) {
        self.clauses.push(clause.into());
        self.params.extend(params);
    }

    /// `column IN (?, ?, …)`; an empty set matches nothing.
    pub fn push_in(&mut self, column: &str, values: impl IntoIterator<Item = Value>) {
        let values: Vec<Value> = values.into_iter().collect();
        if values.is_empty() {
            self.clauses.push("0".to_string());
            return;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        self.push(format!("{} IN ({})", column, placeholders), values);
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// ` WHERE …` or an empty string when nothing was pushed.
    pub fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Parameters followed by `LIMIT ? OFFSET ?` values.
    pub fn paged_params(&self, pagination: &Pagination) -> Vec<Value> {
        let mut params = self.params.clone();
        params.push(Value::Integer(pagination.limit()));
        params.push(Value::Integer(pagination.offset()));
        params
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Search {
    /// `LIKE '%q%'`
    Substring(String),
    /// Full-text `MATCH` ranked by relevance.
    FullText(String),
}

impl Search {
    pub fn from_query(query: &str) -> Option<Self> {
        let query = query.trim();
        if query.is_empty() {
            None
        } else if query.chars().count() <= SUBSTRING_SEARCH_MAX_CHARS {
            Some(Search::Substring(query.to_string()))
        } else {
            Some(Search::FullText(query.to_string()))
        }
    }
}

/// `%q%` with LIKE wildcards escaped; pair with `ESCAPE '\'`.
pub fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Turn free text into an FTS5 expression: each word quoted, any word may
/// match.
pub fn fts_expression(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| format!("\"{}\"", word.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

pub fn text(value: impl Into<String>) -> Value {
    Value::Text(value.into())
}

pub fn int(value: i64) -> Value {
    Value::Integer(value)
}
