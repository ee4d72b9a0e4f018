use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

use super::repo::EntitySchema;

pub const MAX_PAGE_SIZE: i64 = 100;
pub const MAX_SEARCH_LEN: usize = 128;

/// key: list-envelope -> uniform pagination contract
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageEnvelope<T> {
    pub items: Vec<T>,
    pub page: i64,
    pub page_size: i64,
    pub total_count: i64,
    pub total_pages: i64,
    pub has_more: bool,
}

impl<T> PageEnvelope<T> {
    pub fn new(items: Vec<T>, page: i64, page_size: i64, total_count: i64) -> Self {
        let total_pages = if total_count == 0 {
            0
        } else {
            (total_count + page_size - 1) / page_size
        };
        Self {
            items,
            page,
            page_size,
            total_count,
            total_pages,
            has_more: page * page_size < total_count,
        }
    }
}

/// Query-string shape shared by every list endpoint.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub order_by: Option<String>,
    pub search: Option<String>,
}

impl PageRequest {
    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn page_size(&self) -> i64 {
        self.page_size.unwrap_or(20).clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> i64 {
        (self.page() - 1) * self.page_size()
    }

    /// Ordered `(column, descending)` pairs; unknown tokens are dropped, a
    /// leading `-` flips direction. Tokens never reach SQL unvalidated.
    pub fn order(&self, schema: &EntitySchema) -> Vec<(&'static str, bool)> {
        let Some(raw) = self.order_by.as_deref() else {
            return Vec::new();
        };
        raw.split(',')
            .filter_map(|token| {
                let token = token.trim();
                let (name, desc) = match token.strip_prefix('-') {
                    Some(rest) => (rest, true),
                    None => (token, false),
                };
                schema
                    .orderable
                    .iter()
                    .find(|col| **col == name)
                    .map(|col| (*col, desc))
            })
            .collect()
    }

    pub fn search(&self) -> AppResult<Option<String>> {
        match self.search.as_deref() {
            Some(raw) => normalize_search(raw),
            None => Ok(None),
        }
    }
}

/// Trim, collapse runs of whitespace, reject oversized terms. Empty input
/// normalizes to no search at all.
pub fn normalize_search(raw: &str) -> AppResult<Option<String>> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return Ok(None);
    }
    if collapsed.len() > MAX_SEARCH_LEN {
        return Err(AppError::validation(
            "request.invalid_search",
            format!("search term longer than {MAX_SEARCH_LEN} characters"),
        ));
    }
    Ok(Some(collapsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: EntitySchema = EntitySchema {
        table: "widgets",
        orderable: &["name", "created_at", "amount"],
        searchable: &["name"],
        default_order: "created_at DESC",
    };

    #[test]
    fn envelope_math_matches_contract() {
        let env = PageEnvelope::new(vec![1, 2, 3], 2, 3, 10);
        assert_eq!(env.total_pages, 4);
        assert!(env.has_more);
        let last = PageEnvelope::new(vec![1], 4, 3, 10);
        assert!(!last.has_more);
        let empty: PageEnvelope<i32> = PageEnvelope::new(vec![], 1, 20, 0);
        assert_eq!(empty.total_pages, 0);
        assert!(!empty.has_more);
    }

    #[test]
    fn offset_is_zero_based_from_one_based_page() {
        let req = PageRequest {
            page: Some(3),
            page_size: Some(25),
            ..Default::default()
        };
        assert_eq!(req.offset(), 50);
    }

    #[test]
    fn page_size_is_clamped() {
        let req = PageRequest {
            page_size: Some(10_000),
            ..Default::default()
        };
        assert_eq!(req.page_size(), MAX_PAGE_SIZE);
        let req = PageRequest {
            page: Some(0),
            page_size: Some(0),
            ..Default::default()
        };
        assert_eq!(req.page(), 1);
        assert_eq!(req.page_size(), 1);
    }

    #[test]
    fn order_tokens_parse_with_direction() {
        let req = PageRequest {
            order_by: Some("-created_at,name".into()),
            ..Default::default()
        };
        assert_eq!(
            req.order(&SCHEMA),
            vec![("created_at", true), ("name", false)]
        );
    }

    #[test]
    fn unknown_order_tokens_are_dropped() {
        let req = PageRequest {
            order_by: Some("evil; DROP TABLE widgets,-amount".into()),
            ..Default::default()
        };
        assert_eq!(req.order(&SCHEMA), vec![("amount", true)]);
        let req = PageRequest {
            order_by: Some("nope".into()),
            ..Default::default()
        };
        assert!(req.order(&SCHEMA).is_empty());
    }

    #[test]
    fn search_is_trimmed_and_collapsed() {
        assert_eq!(
            normalize_search("  hello    world  ").unwrap(),
            Some("hello world".into())
        );
        assert_eq!(normalize_search("   ").unwrap(), None);
    }

    #[test]
    fn oversized_search_is_rejected() {
        let long = "x".repeat(MAX_SEARCH_LEN + 1);
        assert!(normalize_search(&long).is_err());
    }
}
