//! Page/offset addressing over in-memory result sets.
//!
//! Callers address a result set either as `{page, page_size}` or as
//! `{offset, limit}`. Both normalize to one [`Window`]. Out-of-range values are
//! corrected rather than rejected: sizes clamp to `[1, MAX_PAGE_SIZE]`,
//! pages and offsets clamp to their first valid value, and a page past the
//! end is simply empty.
//!
//! The optional filter runs before slicing, so `total_count` always reflects
//! the filtered set. Item order is never changed.

use rmcp::schemars;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const MAX_PAGE_SIZE: usize = 1000;
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Pagination arguments as they arrive from a caller.
///
/// `offset`/`limit` take precedence over `page`/`page_size` when either is set.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct PaginationParams {
    #[schemars(description = "1-based page number (default 1)")]
    pub page: Option<i64>,

    #[schemars(description = "Items per page, 1 to 1000 (default 100)")]
    pub page_size: Option<i64>,

    #[schemars(description = "Zero-based start index; overrides page when set")]
    pub offset: Option<i64>,

    #[schemars(description = "Maximum items to return; overrides page_size when set")]
    pub limit: Option<i64>,

    #[schemars(description = "Case-insensitive substring filter applied before paging")]
    pub filter: Option<String>,
}

/// Normalized slice of a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: usize,
    pub count: usize,
}

impl PaginationParams {
    pub fn with_page(page: i64, page_size: i64) -> Self {
        Self {
            page: Some(page),
            page_size: Some(page_size),
            ..Self::default()
        }
    }

    pub fn with_offset(offset: i64, limit: i64) -> Self {
        Self {
            offset: Some(offset),
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Filter text, or `None` when absent or blank.
    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref().map(str::trim).filter(|f| !f.is_empty())
    }

    pub fn window(&self) -> Window {
        if self.offset.is_some() || self.limit.is_some() {
            let count = clamp_size(self.limit.or(self.page_size));
            let start = usize::try_from(self.offset.unwrap_or(0).max(0)).unwrap_or(usize::MAX);
            return Window { start, count };
        }
        let count = clamp_size(self.page_size);
        let page = usize::try_from(self.page.unwrap_or(1).max(1)).unwrap_or(usize::MAX);
        Window {
            start: (page - 1).saturating_mul(count),
            count,
        }
    }
}

fn clamp_size(requested: Option<i64>) -> usize {
    match requested {
        None => DEFAULT_PAGE_SIZE,
        Some(size) => {
            let clamped = size.clamp(1, MAX_PAGE_SIZE as i64);
            if clamped != size {
                debug!(requested = size, used = clamped, "Clamped page size");
            }
            usize::try_from(clamped).unwrap_or(DEFAULT_PAGE_SIZE)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageMeta {
    pub page: usize,
    pub page_size: usize,
    pub total_count: usize,
    pub total_pages: usize,
    pub has_next: bool,
    pub has_previous: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_applied: Option<String>,
    /// Set when the size guard shrank the page below `page_size`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returned_count: Option<usize>,
    /// Offset to resume from after a shrunk page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
}

/// One bounded page of results.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: PageMeta,
    #[serde(skip)]
    pub window: Window,
}

impl<T: Serialize> Page<T> {
    /// Render items as JSON values for size enforcement.
    pub fn into_json(self) -> Page<Value> {
        let items = self
            .items
            .iter()
            .map(|item| {
                serde_json::to_value(item)
                    .unwrap_or_else(|e| serde_json::json!({ "serialization_error": e.to_string() }))
            })
            .collect();
        Page {
            items,
            pagination: self.pagination,
            window: self.window,
        }
    }
}

/// Filter `items`, then cut out the requested window.
///
/// `text` renders each item for the filter; it is not called without one.
pub fn paginate<T, F>(items: Vec<T>, params: &PaginationParams, text: F) -> Page<T>
where
    F: Fn(&T) -> String,
{
    let filter = params.filter().map(str::to_lowercase);
    let filtered: Vec<T> = match &filter {
        Some(needle) => items
            .into_iter()
            .filter(|item| text(item).to_lowercase().contains(needle.as_str()))
            .collect(),
        None => items,
    };

    let window = params.window();
    let total_count = filtered.len();
    // Pages are counted from the window start, so an offset that is not a
    // multiple of the size still satisfies `has_next == page < total_pages`.
    let leading = window.start.div_ceil(window.count);
    let total_pages = if window.start < total_count {
        leading + (total_count - window.start).div_ceil(window.count)
    } else {
        total_count.div_ceil(window.count)
    };
    let end = window.start.saturating_add(window.count).min(total_count);
    let page_items: Vec<T> = if window.start < total_count {
        filtered.into_iter().skip(window.start).take(end - window.start).collect()
    } else {
        Vec::new()
    };

    let page = leading + 1;
    Page {
        items: page_items,
        pagination: PageMeta {
            page,
            page_size: window.count,
            total_count,
            total_pages,
            has_next: page < total_pages,
            has_previous: page > 1,
            filter_applied: params.filter().map(str::to_string),
            returned_count: None,
            next_offset: None,
            truncated: None,
        },
        window,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbers(n: usize) -> Vec<usize> {
        (0..n).collect()
    }

    fn page_of(n: usize, params: &PaginationParams) -> Page<usize> {
        paginate(numbers(n), params, ToString::to_string)
    }

    #[test]
    fn second_page_of_245() {
        let page = page_of(245, &PaginationParams::with_page(2, 50));
        assert_eq!(page.items, (50..100).collect::<Vec<_>>());
        let meta = &page.pagination;
        assert_eq!(meta.page, 2);
        assert_eq!(meta.page_size, 50);
        assert_eq!(meta.total_count, 245);
        assert_eq!(meta.total_pages, 5);
        assert!(meta.has_next);
        assert!(meta.has_previous);
        assert!(meta.filter_applied.is_none());
    }

    #[test]
    fn last_page_holds_the_remainder() {
        for (n, size) in [(245usize, 50usize), (1000, 7), (1, 1), (100, 100), (999, 1000), (37, 3)] {
            let last = n.div_ceil(size);
            let page = page_of(n, &PaginationParams::with_page(last as i64, size as i64));
            let expected = if n % size == 0 { size } else { n % size };
            assert!(!page.pagination.has_next, "n={n} size={size}");
            assert_eq!(page.items.len(), expected, "n={n} size={size}");
        }
    }

    #[test]
    fn offset_limit_matches_page_addressing() {
        for (page, size) in [(1, 10), (3, 25), (7, 40)] {
            let by_page = page_of(245, &PaginationParams::with_page(page, size));
            let by_offset = page_of(245, &PaginationParams::with_offset((page - 1) * size, size));
            assert_eq!(by_page.items, by_offset.items);
            assert_eq!(by_page.pagination, by_offset.pagination);
        }
    }

    #[test]
    fn unaligned_offset_keeps_page_counts_consistent() {
        let page = page_of(12, &PaginationParams::with_offset(5, 10));
        assert_eq!(page.items, (5..12).collect::<Vec<_>>());
        let meta = &page.pagination;
        assert_eq!(meta.page, 2);
        assert_eq!(meta.total_pages, 2);
        assert!(!meta.has_next);
        assert!(meta.has_previous);

        let page = page_of(30, &PaginationParams::with_offset(5, 10));
        let meta = &page.pagination;
        assert_eq!((meta.page, meta.total_pages), (2, 4));
        assert!(meta.has_next);

        for (offset, limit, n) in [(3i64, 7i64, 50usize), (1, 2, 5), (9, 4, 9), (0, 3, 10), (11, 5, 40)] {
            let meta = page_of(n, &PaginationParams::with_offset(offset, limit)).pagination;
            assert_eq!(meta.has_next, meta.page < meta.total_pages, "offset={offset} limit={limit} n={n}");
        }
    }

    #[test]
    fn page_beyond_end_is_empty_with_accurate_metadata() {
        let page = page_of(245, &PaginationParams::with_page(9, 50));
        assert!(page.items.is_empty());
        assert_eq!(page.pagination.total_count, 245);
        assert_eq!(page.pagination.total_pages, 5);
        assert!(!page.pagination.has_next);
        assert!(page.pagination.has_previous);
    }

    #[test]
    fn sizes_and_pages_are_clamped() {
        let huge = PaginationParams::with_page(1, 50_000).window();
        assert_eq!(huge, Window { start: 0, count: MAX_PAGE_SIZE });
        let zero = PaginationParams::with_page(0, 0).window();
        assert_eq!(zero, Window { start: 0, count: 1 });
        let negative = PaginationParams::with_offset(-5, -1).window();
        assert_eq!(negative, Window { start: 0, count: 1 });
        assert_eq!(PaginationParams::default().window(), Window { start: 0, count: 100 });
    }

    #[test]
    fn filter_applies_before_slicing() {
        let items = vec!["sale.order", "sale.order.line", "res.partner", "SALE.report"];
        let params = PaginationParams {
            filter: Some("Sale".into()),
            ..PaginationParams::with_page(1, 2)
        };
        let page = paginate(items, &params, ToString::to_string);
        assert_eq!(page.items, vec!["sale.order", "sale.order.line"]);
        assert_eq!(page.pagination.total_count, 3);
        assert_eq!(page.pagination.total_pages, 2);
        assert_eq!(page.pagination.filter_applied.as_deref(), Some("Sale"));
    }

    #[test]
    fn filtering_is_idempotent() {
        let items: Vec<String> = (0..300).map(|i| format!("model.{i}")).collect();
        let params = PaginationParams {
            filter: Some("1".into()),
            ..PaginationParams::with_page(1, 1000)
        };
        let once = paginate(items, &params, Clone::clone);
        let twice = paginate(once.items.clone(), &params, Clone::clone);
        assert_eq!(once.items, twice.items);
        assert_eq!(once.pagination.total_count, twice.pagination.total_count);
    }

    #[test]
    fn blank_filter_is_ignored() {
        let params = PaginationParams {
            filter: Some("   ".into()),
            ..PaginationParams::default()
        };
        let page = page_of(10, &params);
        assert_eq!(page.items.len(), 10);
        assert!(page.pagination.filter_applied.is_none());
    }

    #[test]
    fn empty_input() {
        let page = page_of(0, &PaginationParams::default());
        assert!(page.items.is_empty());
        assert_eq!(page.pagination.total_pages, 0);
        assert!(!page.pagination.has_next);
        assert!(!page.pagination.has_previous);
    }

    #[test]
    fn serialized_shape() {
        let page = page_of(3, &PaginationParams::with_page(1, 2)).into_json();
        let value = serde_json::to_value(&page).unwrap();
        assert_eq!(value["items"], serde_json::json!([0, 1]));
        assert_eq!(value["pagination"]["has_next"], serde_json::json!(true));
        assert!(value["pagination"].get("next_offset").is_none());
        assert!(value.get("window").is_none());
    }
}
