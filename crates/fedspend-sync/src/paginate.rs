use fedspend_adapters::{MappingError, PageRequest, SourceClient, SourceError};
use fedspend_core::NormalizedRecord;
use tracing::{debug, warn};

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_MAX_PAGES: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub page_size: u32,
    /// Hard stop even when the provider keeps signalling more pages.
    pub max_pages: u32,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

/// One fetched page after mapping.
#[derive(Debug)]
pub struct PageBatch {
    pub page: u32,
    /// Records as returned by the provider, before mapping.
    pub raw_count: usize,
    pub records: Vec<NormalizedRecord>,
    pub rejected: Vec<MappingError>,
}

/// Everything a full pagination produced, including a terminal error if one stopped it.
#[derive(Debug, Default)]
pub struct Harvest {
    pub pages: u32,
    pub records: Vec<NormalizedRecord>,
    pub rejected: Vec<MappingError>,
    pub error: Option<SourceError>,
}

/// Drives one query through a source's pages, strictly in order.
///
/// Pagination stops when the provider signals no more pages, when a page comes back
/// shorter than the requested size, after a page error, or at the page cap. A
/// paginator is not restartable; a new one starts again from page 1.
pub struct Paginator<'a, C: SourceClient> {
    client: &'a C,
    params: &'a C::Params,
    limits: PageLimits,
    next: Option<PageRequest>,
    fetched: u32,
}

impl<'a, C: SourceClient> Paginator<'a, C> {
    pub fn new(client: &'a C, params: &'a C::Params, limits: PageLimits) -> Self {
        Self {
            client,
            params,
            limits,
            next: Some(PageRequest::first(limits.page_size)),
            fetched: 0,
        }
    }

    /// The next page, or `None` once pagination has terminated. An error is yielded
    /// once and ends the sequence.
    pub async fn next_page(&mut self) -> Option<Result<PageBatch, SourceError>> {
        let request = self.next.take()?;
        let source_id = self.client.source_id();

        let page = match self.client.fetch_page(self.params, request).await {
            Ok(page) => page,
            Err(err) => {
                warn!(source_id, page = request.page, error = %err, "page fetch failed; stopping pagination");
                return Some(Err(err));
            }
        };
        self.fetched += 1;

        let raw_count = page.records.len();
        let short_page = raw_count < request.limit as usize;
        if page.has_more && !short_page {
            if self.fetched >= self.limits.max_pages {
                warn!(source_id, max_pages = self.limits.max_pages, "page cap reached with more pages pending");
            } else {
                self.next = Some(request.next());
            }
        }
        debug!(source_id, page = request.page, raw_count, has_more = self.next.is_some(), "page fetched");

        let mut records = Vec::with_capacity(raw_count);
        let mut rejected = Vec::new();
        for (position, raw) in page.records.into_iter().enumerate() {
            match self.client.normalize(raw) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(source_id, page = request.page, position, error = %err, "record rejected");
                    rejected.push(err);
                }
            }
        }

        Some(Ok(PageBatch {
            page: request.page,
            raw_count,
            records,
            rejected,
        }))
    }

    /// Drains the paginator. Records from pages before a failing page are kept.
    pub async fn collect_all(mut self) -> Harvest {
        let mut harvest = Harvest::default();
        while let Some(result) = self.next_page().await {
            match result {
                Ok(batch) => {
                    harvest.pages += 1;
                    harvest.records.extend(batch.records);
                    harvest.rejected.extend(batch.rejected);
                }
                Err(err) => harvest.error = Some(err),
            }
        }
        harvest
    }
}
