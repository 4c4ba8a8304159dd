//! Page/limit pagination for history queries.

use serde::{Deserialize, Serialize};

/// A requested page. Out-of-range values fall back to defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawPageRequest")]
pub struct PageRequest {
    page: u32,
    limit: u32,
}

/// Wire shape of a page request before normalization.
#[derive(Deserialize)]
struct RawPageRequest {
    #[serde(default)]
    page: u32,
    #[serde(default)]
    limit: u32,
}

impl From<RawPageRequest> for PageRequest {
    fn from(raw: RawPageRequest) -> Self {
        PageRequest::new(raw.page, raw.limit)
    }
}

impl PageRequest {
    pub const DEFAULT_LIMIT: u32 = 20;
    pub const MAX_LIMIT: u32 = 100;

    /// Normalize a page request: page < 1 becomes 1, a limit outside
    /// `1..=MAX_LIMIT` becomes `DEFAULT_LIMIT`.
    pub fn new(page: u32, limit: u32) -> Self {
        let page = page.max(1);
        let limit = if (1..=Self::MAX_LIMIT).contains(&limit) {
            limit
        } else {
            Self::DEFAULT_LIMIT
        };
        Self { page, limit }
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Number of rows to skip.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }

    /// Slice an already-ordered collection according to this request.
    pub fn slice<T: Clone>(&self, items: &[T]) -> Page<T> {
        let start = (self.offset() as usize).min(items.len());
        let end = (start + self.limit as usize).min(items.len());
        Page {
            items: items[start..end].to_vec(),
            page: self.page,
            limit: self.limit,
            total: items.len() as u64,
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, Self::DEFAULT_LIMIT)
    }
}

/// One page of results plus the total row count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

impl<T> Page<T> {
    /// Total number of pages (ceiling division).
    pub fn total_pages(&self) -> u64 {
        if self.limit == 0 {
            return 0;
        }
        (self.total + u64::from(self.limit) - 1) / u64::from(self.limit)
    }
}
