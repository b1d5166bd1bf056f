//! Query-string grammar for list endpoints.
//!
//! Keys of the form `<op>_<column>` become column filters, `sort`, `page` and
//! `page_size` control ordering and paging, and every other key is kept as a
//! named argument for RPC-backed resources.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryParseError {
    #[error("invalid column name '{0}'")]
    InvalidColumn(String),
    #[error("invalid sort direction '{0}'")]
    InvalidSortDirection(String),
    #[error("invalid value for {key}: '{value}'")]
    InvalidNumber { key: String, value: String },
    #[error("invalid is_ value '{0}', expected null, true or false")]
    InvalidIsValue(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsValue {
    Null,
    True,
    False,
}

impl IsValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsValue::Null => "null",
            IsValue::True => "true",
            IsValue::False => "false",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "lowercase")]
pub enum FilterOp {
    Eq(String),
    Neq(String),
    Gt(String),
    Gte(String),
    Lt(String),
    Lte(String),
    /// Pattern already in SQL `LIKE` form (`%` wildcards).
    ILike(String),
    In(Vec<String>),
    Is(IsValue),
}

impl FilterOp {
    pub fn name(&self) -> &'static str {
        match self {
            FilterOp::Eq(_) => "eq",
            FilterOp::Neq(_) => "neq",
            FilterOp::Gt(_) => "gt",
            FilterOp::Gte(_) => "gte",
            FilterOp::Lt(_) => "lt",
            FilterOp::Lte(_) => "lte",
            FilterOp::ILike(_) => "ilike",
            FilterOp::In(_) => "in",
            FilterOp::Is(_) => "is",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFilter {
    pub column: String,
    pub op: FilterOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    pub descending: bool,
}

impl SortKey {
    pub fn render(&self) -> String {
        format!(
            "{}.{}",
            self.column,
            if self.descending { "desc" } else { "asc" }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            max_page_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    pub filters: Vec<ColumnFilter>,
    pub sort: Vec<SortKey>,
    pub page: u32,
    pub page_size: u32,
    pub args: BTreeMap<String, String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            sort: Vec::new(),
            page: 1,
            page_size: PageLimits::default().default_page_size,
            args: BTreeMap::new(),
        }
    }
}

const FILTER_PREFIXES: [&str; 9] = [
    "eq_", "neq_", "gte_", "gt_", "lte_", "lt_", "ilike_", "in_", "is_",
];

impl ListQuery {
    pub fn from_pairs<I, K, V>(pairs: I, limits: PageLimits) -> Result<Self, QueryParseError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut query = ListQuery {
            page_size: limits.default_page_size,
            ..Default::default()
        };

        for (key, value) in pairs {
            let key = key.as_ref().trim();
            let value = value.as_ref();
            match key {
                "sort" => query.sort = parse_sort(value)?,
                "page" => query.page = parse_u32(key, value)?.max(1),
                "page_size" => {
                    query.page_size = parse_u32(key, value)?.clamp(1, limits.max_page_size.max(1))
                }
                _ => match split_filter_key(key) {
                    Some((prefix, column)) => {
                        let column = validate_column(column)?;
                        let op = parse_op(prefix, value)?;
                        query.filters.push(ColumnFilter { column, op });
                    }
                    None => {
                        query.args.insert(key.to_string(), value.to_string());
                    }
                },
            }
        }
        Ok(query)
    }

    /// Uses `default` when the caller did not ask for an order.
    pub fn with_default_sort(mut self, default: &str) -> Result<Self, QueryParseError> {
        if self.sort.is_empty() {
            self.sort = parse_sort(default)?;
        }
        Ok(self)
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    pub fn sort_string(&self) -> String {
        self.sort
            .iter()
            .map(SortKey::render)
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub has_more: bool,
    pub sort: String,
}

impl PageMeta {
    pub fn new(query: &ListQuery, total: u64) -> Self {
        let seen = u64::from(query.page) * u64::from(query.page_size);
        Self {
            page: query.page,
            page_size: query.page_size,
            total,
            has_more: seen < total,
            sort: query.sort_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    pub meta: PageMeta,
}

fn split_filter_key(key: &str) -> Option<(&'static str, &str)> {
    FILTER_PREFIXES
        .iter()
        .find_map(|prefix| key.strip_prefix(prefix).map(|col| (*prefix, col)))
}

pub fn validate_column(name: &str) -> Result<String, QueryParseError> {
    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(QueryParseError::InvalidColumn(name.to_string()));
    }
    Ok(name.to_string())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, QueryParseError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| QueryParseError::InvalidNumber {
            key: key.to_string(),
            value: value.to_string(),
        })
}

fn parse_op(prefix: &str, value: &str) -> Result<FilterOp, QueryParseError> {
    let v = value.to_string();
    Ok(match prefix {
        "eq_" => FilterOp::Eq(v),
        "neq_" => FilterOp::Neq(v),
        "gt_" => FilterOp::Gt(v),
        "gte_" => FilterOp::Gte(v),
        "lt_" => FilterOp::Lt(v),
        "lte_" => FilterOp::Lte(v),
        "ilike_" => FilterOp::ILike(like_pattern(value)),
        "in_" => FilterOp::In(
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect(),
        ),
        "is_" => FilterOp::Is(match value.trim().to_ascii_lowercase().as_str() {
            "null" => IsValue::Null,
            "true" => IsValue::True,
            "false" => IsValue::False,
            _ => return Err(QueryParseError::InvalidIsValue(value.to_string())),
        }),
        _ => unreachable!("prefix list and parser are kept in sync"),
    })
}

fn like_pattern(value: &str) -> String {
    let pattern = value.replace('*', "%");
    if pattern.contains('%') {
        pattern
    } else {
        format!("%{pattern}%")
    }
}

fn parse_sort(value: &str) -> Result<Vec<SortKey>, QueryParseError> {
    let mut keys = Vec::new();
    for part in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (column, descending) = if let Some(col) = part.strip_prefix('-') {
            (col, true)
        } else if let Some((col, dir)) = part.rsplit_once('.') {
            match dir.to_ascii_lowercase().as_str() {
                "asc" => (col, false),
                "desc" => (col, true),
                _ => return Err(QueryParseError::InvalidSortDirection(dir.to_string())),
            }
        } else {
            (part, false)
        };
        keys.push(SortKey {
            column: validate_column(column)?,
            descending,
        });
    }
    Ok(keys)
}
