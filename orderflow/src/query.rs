//! Order listing, pagination and statistics.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::order::{Order, OrderStatus};
use crate::types::{Money, UserId};

/// Page size used when listing all orders without a valid limit.
pub const DEFAULT_PAGE_SIZE: u32 = 20;
/// Largest page size accepted when listing all orders.
pub const MAX_PAGE_SIZE: u32 = 100;
/// Page size used when listing one user's orders without a valid limit.
pub const DEFAULT_USER_PAGE_SIZE: u32 = 10;
/// Largest page size accepted when listing one user's orders.
pub const MAX_USER_PAGE_SIZE: u32 = 50;

/// A 1-based page number and page size.
///
/// Deserialized values are normalized like all-orders query parameters, so a
/// page size is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawPageRequest")]
pub struct PageRequest {
    number: u32,
    size: u32,
}

#[derive(Deserialize)]
struct RawPageRequest {
    number: Option<u32>,
    size: Option<u32>,
}

impl From<RawPageRequest> for PageRequest {
    fn from(raw: RawPageRequest) -> Self {
        Self::for_orders(raw.number, raw.size)
    }
}

impl PageRequest {
    /// Normalizes raw query parameters.
    ///
    /// A missing or zero page becomes page 1. A missing limit, or one outside
    /// `1..=max`, becomes `default`.
    pub fn new(page: Option<u32>, limit: Option<u32>, default: u32, max: u32) -> Self {
        let number = page.filter(|page| *page >= 1).unwrap_or(1);
        let size = limit
            .filter(|limit| (1..=max).contains(limit))
            .unwrap_or(default);
        Self { number, size }
    }

    /// Page parameters for the all-orders listing.
    pub fn for_orders(page: Option<u32>, limit: Option<u32>) -> Self {
        Self::new(page, limit, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE)
    }

    /// Page parameters for a single user's orders.
    pub fn for_user(page: Option<u32>, limit: Option<u32>) -> Self {
        Self::new(page, limit, DEFAULT_USER_PAGE_SIZE, MAX_USER_PAGE_SIZE)
    }

    /// 1-based page number.
    pub const fn number(&self) -> u32 {
        self.number
    }

    /// Page size.
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Rows to skip.
    pub const fn offset(&self) -> u64 {
        (self.number as u64 - 1) * self.size as u64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::for_orders(None, None)
    }
}

/// Filters for listing orders. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderQuery {
    /// Only orders in this status.
    pub status: Option<OrderStatus>,
    /// Only orders owned by this user.
    pub user_id: Option<UserId>,
    /// Which page.
    pub page: PageRequest,
}

impl OrderQuery {
    /// Whether `order` passes the filters.
    pub fn matches(&self, order: &Order) -> bool {
        self.status.map_or(true, |status| order.status == status)
            && self
                .user_id
                .as_ref()
                .map_or(true, |user_id| &order.user_id == user_id)
    }
}

/// Pagination metadata returned alongside a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// 1-based page number.
    pub current_page: u32,
    /// Page size.
    pub per_page: u32,
    /// Matching items across all pages.
    pub total_items: u64,
    /// Number of pages.
    pub total_pages: u64,
    /// Whether a later page exists.
    pub has_next: bool,
    /// Whether an earlier page exists.
    pub has_prev: bool,
}

impl Pagination {
    /// Metadata for `page` over `total_items` matches.
    pub fn new(page: PageRequest, total_items: u64) -> Self {
        let per_page = u64::from(page.size());
        let total_pages = total_items.div_ceil(per_page);
        Self {
            current_page: page.number(),
            per_page: page.size(),
            total_items,
            total_pages,
            has_next: u64::from(page.number()) < total_pages,
            has_prev: page.number() > 1,
        }
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Pagination metadata.
    pub pagination: Pagination,
}

/// Aggregate order statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderStats {
    /// Orders ever created.
    pub total_orders: u64,
    /// Sum of order totals.
    pub total_revenue: Money,
    /// Sum of discounts granted.
    pub total_discount: Money,
    /// Orders created on the given day (UTC).
    pub orders_today: u64,
}

impl OrderStats {
    /// Aggregates `orders`, counting those created on `today`.
    pub fn from_orders<'a>(orders: impl IntoIterator<Item = &'a Order>, today: NaiveDate) -> Self {
        let mut total_orders = 0;
        let mut orders_today = 0;
        let mut revenue = Vec::new();
        let mut discount = Vec::new();
        for order in orders {
            total_orders += 1;
            if order.created_at.date() == today {
                orders_today += 1;
            }
            revenue.push(order.totals.total());
            discount.push(order.totals.discount_amount());
        }
        Self {
            total_orders,
            total_revenue: revenue.into_iter().sum(),
            total_discount: discount.into_iter().sum(),
            orders_today,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialized_page_request_is_normalized() {
        let page: PageRequest =
            serde_json::from_value(serde_json::json!({"number": 0, "size": 0})).unwrap();
        assert_eq!((page.number(), page.size()), (1, 20));

        // a zero size would otherwise divide by zero here
        let pagination = Pagination::new(page, 45);
        assert_eq!(pagination.total_pages, 3);

        let page: PageRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(page, PageRequest::default());
    }

    #[test]
    fn page_request_normalizes_parameters() {
        let page = PageRequest::for_orders(Some(0), Some(0));
        assert_eq!((page.number(), page.size()), (1, 20));

        let page = PageRequest::for_orders(Some(3), Some(101));
        assert_eq!((page.number(), page.size()), (3, 20));

        let page = PageRequest::for_orders(Some(2), Some(100));
        assert_eq!((page.number(), page.size(), page.offset()), (2, 100, 100));

        let page = PageRequest::for_user(None, Some(60));
        assert_eq!((page.number(), page.size()), (1, 10));

        let page = PageRequest::for_user(None, Some(50));
        assert_eq!(page.size(), 50);
    }

    #[test]
    fn pagination_metadata() {
        let meta = Pagination::new(PageRequest::for_orders(Some(2), Some(10)), 25);
        assert_eq!(meta.total_pages, 3);
        assert!(meta.has_next);
        assert!(meta.has_prev);

        let last = Pagination::new(PageRequest::for_orders(Some(3), Some(10)), 25);
        assert!(!last.has_next);

        let empty = Pagination::new(PageRequest::default(), 0);
        assert_eq!(empty.total_pages, 0);
        assert!(!empty.has_next);
        assert!(!empty.has_prev);
    }
}
