//! Pagination and sorting types.
//!
//! This module provides the request side ([`PageRequest`], [`Sort`]) and the
//! two result shapes returned by paged queries: [`Page`], which carries a
//! total count, and [`Slice`], which only knows whether another page exists.
//! Page numbers are 0-indexed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default items per page
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending order
    Asc,
    /// Descending order
    Desc,
}

impl Default for SortDirection {
    fn default() -> Self {
        Self::Asc
    }
}

impl SortDirection {
    /// Whether this is descending order.
    pub fn is_descending(&self) -> bool {
        matches!(self, Self::Desc)
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asc => write!(f, "ASC"),
            Self::Desc => write!(f, "DESC"),
        }
    }
}

impl From<&str> for SortDirection {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "desc" | "descending" => Self::Desc,
            _ => Self::Asc,
        }
    }
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Order {
    /// Property path, e.g. `username` or `team.name`
    pub property: String,

    /// Sort direction
    #[serde(default)]
    pub direction: SortDirection,
}

impl Order {
    /// Create a new sort key.
    pub fn new(property: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            property: property.into(),
            direction,
        }
    }

    /// Ascending sort key.
    pub fn asc(property: impl Into<String>) -> Self {
        Self::new(property, SortDirection::Asc)
    }

    /// Descending sort key.
    pub fn desc(property: impl Into<String>) -> Self {
        Self::new(property, SortDirection::Desc)
    }
}

/// Ordered list of sort keys, highest priority first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sort {
    orders: Vec<Order>,
}

impl Sort {
    /// No ordering.
    pub fn unsorted() -> Self {
        Self::default()
    }

    /// Sort by the given properties, all in `direction`.
    pub fn by(direction: SortDirection, properties: &[&str]) -> Self {
        Self {
            orders: properties
                .iter()
                .map(|p| Order::new(*p, direction))
                .collect(),
        }
    }

    /// Sort ascending by one property.
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            orders: vec![Order::asc(property)],
        }
    }

    /// Sort descending by one property.
    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            orders: vec![Order::desc(property)],
        }
    }

    /// Append the keys of `other` with lower priority.
    pub fn and(mut self, other: Sort) -> Self {
        self.orders.extend(other.orders);
        self
    }

    /// Append one key with lower priority.
    pub fn then(mut self, order: Order) -> Self {
        self.orders.push(order);
        self
    }

    /// Whether no key is present.
    pub fn is_unsorted(&self) -> bool {
        self.orders.is_empty()
    }

    /// Sort keys in priority order.
    pub fn orders(&self) -> &[Order] {
        &self.orders
    }
}

impl From<Vec<Order>> for Sort {
    fn from(orders: Vec<Order>) -> Self {
        Self { orders }
    }
}

/// Request for one page of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Page number (0-indexed)
    pub page: u32,

    /// Items per page
    pub size: u32,

    /// Ordering applied before windowing
    #[serde(default)]
    pub sort: Sort,
}

impl PageRequest {
    /// Unsorted page request.
    pub fn of(page: u32, size: u32) -> Self {
        Self {
            page,
            size,
            sort: Sort::unsorted(),
        }
    }

    /// Sorted page request.
    pub fn of_sorted(page: u32, size: u32, sort: Sort) -> Self {
        Self { page, size, sort }
    }

    /// First page with the given size.
    pub fn first_page(size: u32) -> Self {
        Self::of(0, size)
    }

    /// Replace the sort.
    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    /// Rows skipped before this page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.size)
    }

    /// Rows in this page.
    pub fn limit(&self) -> u64 {
        u64::from(self.size)
    }

    /// Request for the following page.
    pub fn next(&self) -> Self {
        Self {
            page: self.page + 1,
            size: self.size,
            sort: self.sort.clone(),
        }
    }

    /// Request for the previous page, or this one if it is the first.
    pub fn previous_or_first(&self) -> Self {
        Self {
            page: self.page.saturating_sub(1),
            size: self.size,
            sort: self.sort.clone(),
        }
    }

    /// Validate the request against a maximum page size.
    pub fn validate(&self, max_size: u32) -> Result<(), String> {
        if self.size == 0 {
            return Err("Page size must be greater than 0".to_string());
        }
        if self.size > max_size {
            return Err(format!("Page size cannot exceed {}", max_size));
        }
        Ok(())
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::of(0, DEFAULT_PAGE_SIZE)
    }
}

/// A window of results plus the total number of matching rows.
///
/// The total comes from a separate count statement; under concurrent writes it
/// may disagree slightly with the content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items of this page, in query order
    pub content: Vec<T>,

    /// Page number (0-indexed)
    pub number: u32,

    /// Requested page size
    pub size: u32,

    /// Rows matching the filter across all pages
    pub total_elements: u64,
}

impl<T> Page<T> {
    /// Create a new page.
    pub fn new(content: Vec<T>, request: &PageRequest, total_elements: u64) -> Self {
        Self {
            content,
            number: request.page,
            size: request.size,
            total_elements,
        }
    }

    /// `ceil(total_elements / size)`.
    pub fn total_pages(&self) -> u64 {
        if self.size == 0 {
            return 1;
        }
        self.total_elements.div_ceil(u64::from(self.size))
    }

    /// Whether this is the first page.
    pub fn is_first(&self) -> bool {
        self.number == 0
    }

    /// Whether rows exist past this page.
    pub fn has_next(&self) -> bool {
        (u64::from(self.number) + 1) * u64::from(self.size) < self.total_elements
    }

    /// Whether this is the last page.
    pub fn is_last(&self) -> bool {
        !self.has_next()
    }

    /// Whether a previous page exists.
    pub fn has_previous(&self) -> bool {
        self.number > 0
    }

    /// Number of items on this page.
    pub fn number_of_elements(&self) -> usize {
        self.content.len()
    }

    /// Transform the content eagerly, keeping every piece of metadata.
    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            content: self.content.into_iter().map(f).collect(),
            number: self.number,
            size: self.size,
            total_elements: self.total_elements,
        }
    }
}

/// A window of results that only knows whether another page follows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slice<T> {
    /// Items of this slice, in query order
    pub content: Vec<T>,

    /// Page number (0-indexed)
    pub number: u32,

    /// Requested page size
    pub size: u32,

    /// Whether a probe row past this slice existed
    pub has_next: bool,
}

impl<T> Slice<T> {
    /// Create a new slice.
    pub fn new(content: Vec<T>, request: &PageRequest, has_next: bool) -> Self {
        Self {
            content,
            number: request.page,
            size: request.size,
            has_next,
        }
    }

    /// Whether this is the first slice.
    pub fn is_first(&self) -> bool {
        self.number == 0
    }

    /// Whether rows exist past this slice.
    pub fn has_next(&self) -> bool {
        self.has_next
    }

    /// Whether this is the last slice.
    pub fn is_last(&self) -> bool {
        !self.has_next
    }

    /// Whether a previous slice exists.
    pub fn has_previous(&self) -> bool {
        self.number > 0
    }

    /// Transform the content eagerly, keeping every piece of metadata.
    pub fn map<U, F>(self, f: F) -> Slice<U>
    where
        F: FnMut(T) -> U,
    {
        Slice {
            content: self.content.into_iter().map(f).collect(),
            number: self.number,
            size: self.size,
            has_next: self.has_next,
        }
    }
}
