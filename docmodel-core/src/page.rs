//! Pagination parameters and result pages.
//!
//! A paginated read is executed as a single `$facet` stage (see
//! [`Pipeline::paginate`](crate::pipeline::Pipeline::paginate)); the executor decodes
//! both branches into a [`Page`] whose navigation fields are derived here.

use serde::{Deserialize, Serialize};

/// A single page of results plus navigation metadata.
///
/// # Type Parameters
///
/// * `T` - The type of documents contained in this page
///
/// # Example
///
/// ```ignore
/// use docmodel::page::Page;
///
/// let page: Page<u32> = Page::builder(vec![7])
///     .with_total_docs(7)
///     .with_page(4)
///     .with_limit(2)
///     .build();
///
/// assert_eq!(page.total_pages, 4);
/// assert!(!page.has_next);
/// assert_eq!(page.prev_page, Some(3));
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    /// The documents on this page.
    pub docs: Vec<T>,
    /// Number of documents the query selects across all pages.
    pub total_docs: u64,
    /// Page size.
    pub limit: u64,
    /// The 1-based number of this page.
    pub page: u64,
    /// `ceil(total_docs / limit)`.
    pub total_pages: u64,
    /// `page - 1`, or `None` when that falls outside `[1, total_pages]`.
    pub prev_page: Option<u64>,
    /// `page + 1`, or `None` when that falls outside `[1, total_pages]`.
    pub next_page: Option<u64>,
    pub has_prev: bool,
    pub has_next: bool,
}

impl<T> Page<T> {
    /// Creates a new builder for constructing a page.
    pub fn builder(docs: Vec<T>) -> PageBuilder<T> {
        PageBuilder::new(docs)
    }

    /// Converts the documents of this page, keeping the navigation metadata.
    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            docs: self.docs.into_iter().map(f).collect(),
            total_docs: self.total_docs,
            limit: self.limit,
            page: self.page,
            total_pages: self.total_pages,
            prev_page: self.prev_page,
            next_page: self.next_page,
            has_prev: self.has_prev,
            has_next: self.has_next,
        }
    }

    /// Fallible variant of [`Page::map`].
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `f`.
    pub fn try_map<U, E, F>(self, f: F) -> Result<Page<U>, E>
    where
        F: FnMut(T) -> Result<U, E>,
    {
        let docs = self.docs.into_iter().map(f).collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            docs,
            total_docs: self.total_docs,
            limit: self.limit,
            page: self.page,
            total_pages: self.total_pages,
            prev_page: self.prev_page,
            next_page: self.next_page,
            has_prev: self.has_prev,
            has_next: self.has_next,
        })
    }
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Page::builder(Vec::new()).build()
    }
}

/// Builder for [`Page`]; navigation fields are computed in [`PageBuilder::build`].
pub struct PageBuilder<T> {
    docs: Vec<T>,
    total_docs: u64,
    page: u64,
    limit: u64,
}

impl<T> PageBuilder<T> {
    /// Creates a new builder with the given documents.
    pub fn new(docs: Vec<T>) -> Self {
        Self {
            docs,
            total_docs: 0,
            page: 1,
            limit: 10,
        }
    }

    /// Sets the total number of documents across all pages.
    pub fn with_total_docs(mut self, total_docs: u64) -> Self {
        self.total_docs = total_docs;
        self
    }

    /// Sets the 1-based page number.
    pub fn with_page(mut self, page: u64) -> Self {
        self.page = page;
        self
    }

    /// Sets the page size.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Builds the page and derives its navigation metadata.
    pub fn build(self) -> Page<T> {
        let limit = self.limit.max(1);
        let page = self.page.max(1);
        let total_pages = self.total_docs.div_ceil(limit);
        let in_range = |n: u64| (1..=total_pages).contains(&n);

        let prev_page = page.checked_sub(1).filter(|n| in_range(*n));
        let next_page = page.checked_add(1).filter(|n| in_range(*n));

        Page {
            docs: self.docs,
            total_docs: self.total_docs,
            limit,
            page,
            total_pages,
            prev_page,
            next_page,
            has_prev: page > 1,
            has_next: page < total_pages,
        }
    }
}

/// Parameters for paginating through large result sets.
///
/// Pages are 1-indexed (page 1 is the first page).
///
/// # Example
///
/// ```ignore
/// use docmodel::page::PaginationParams;
///
/// let params = PaginationParams::new(3, 20);
/// assert_eq!(params.offset(), 40);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationParams {
    /// The page number (1-indexed).
    pub page: u64,
    /// Number of documents per page.
    pub per_page: u64,
}

impl PaginationParams {
    /// Creates new pagination parameters.
    ///
    /// # Arguments
    ///
    /// * `page` - The page number (1-indexed)
    /// * `per_page` - Number of documents per page
    pub fn new(page: u64, per_page: u64) -> Self {
        Self { page, per_page }
    }

    /// Calculates the number of documents to skip for this page.
    pub fn offset(&self) -> u64 {
        self.page.saturating_sub(1) * self.per_page
    }
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self { page: 1, per_page: 10 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(7, 2, 1, 4, None, Some(2), false, true)]
    #[case(7, 2, 2, 4, Some(1), Some(3), true, true)]
    #[case(7, 2, 4, 4, Some(3), None, true, false)]
    #[case(7, 2, 9, 4, None, None, true, false)]
    #[case(0, 5, 1, 0, None, None, false, false)]
    #[case(10, 5, 2, 2, Some(1), None, true, false)]
    #[case(1, 1, 1, 1, None, None, false, false)]
    fn test_navigation(
        #[case] total: u64,
        #[case] limit: u64,
        #[case] page: u64,
        #[case] total_pages: u64,
        #[case] prev: Option<u64>,
        #[case] next: Option<u64>,
        #[case] has_prev: bool,
        #[case] has_next: bool,
    ) {
        let built: Page<()> = Page::builder(Vec::new())
            .with_total_docs(total)
            .with_limit(limit)
            .with_page(page)
            .build();

        assert_eq!(built.total_pages, total_pages);
        assert_eq!(built.prev_page, prev);
        assert_eq!(built.next_page, next);
        assert_eq!(built.has_prev, has_prev);
        assert_eq!(built.has_next, has_next);
    }

    #[test]
    fn test_serializes_camel_case() {
        let page = Page::builder(vec![1]).with_total_docs(1).with_limit(1).build();
        let json = serde_json::to_value(&page).unwrap();

        assert_eq!(json["totalDocs"], 1);
        assert_eq!(json["totalPages"], 1);
        assert_eq!(json["hasNext"], false);
    }

    #[test]
    fn test_offset() {
        assert_eq!(PaginationParams::new(1, 20).offset(), 0);
        assert_eq!(PaginationParams::new(3, 20).offset(), 40);
        assert_eq!(PaginationParams::new(0, 20).offset(), 0);
    }
}
