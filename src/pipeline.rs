use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cleaner::clean_page;
use crate::cleaner::rules::{Admission, RecordFilter};
use crate::cleaner::FieldIssue;
use crate::error::{CollectError, Result};
use crate::fetcher::{ApiClient, Page};
use crate::record::Endpoint;
use crate::settings::Settings;
use crate::writer::{write_json_atomic, Writer};

/// Fetched pages waiting to be cleaned. Keeps at most one page in flight
/// ahead of the writer.
const CHANNEL_CAPACITY: usize = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub pages: usize,
    pub fetched: usize,
    pub written: usize,
    pub skipped_cancelled: usize,
    pub skipped_export: usize,
    pub skipped_duplicate: usize,
    /// Document fields stored as plain text because they did not parse.
    pub doc_fallbacks: usize,
    #[serde(skip)]
    pub error_report: Vec<ReportEntry>,
}

/// A written record with at least one document field kept as plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    #[serde(rename = "ITEM_SEQ")]
    pub item_seq: String,
    #[serde(rename = "ITEM_NAME")]
    pub item_name: String,
    pub error_fields: Vec<FieldIssue>,
}

impl RunSummary {
    pub fn skipped(&self) -> usize {
        self.skipped_cancelled + self.skipped_export + self.skipped_duplicate
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The page held only identifiers seen before in this run.
    Repeated,
}

/// Collect one endpoint into `writer`. The first error from any stage stops
/// the run and is returned; the caller decides whether to `finish` the writer.
pub async fn run(
    settings: &Settings,
    endpoint: Endpoint,
    writer: &mut Writer,
    max_pages: Option<u32>,
) -> Result<RunSummary> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pages {msg}")
            .map_err(|e| CollectError::Config(e.to_string()))?
            .progress_chars("#>-"),
    );
    run_with_bar(settings, endpoint, writer, max_pages, &pb).await
}

/// Clears the bar on every way out of a run, early `?` returns included.
struct ClearOnDrop<'a>(&'a ProgressBar);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.finish_and_clear();
    }
}

async fn run_with_bar(
    settings: &Settings,
    endpoint: Endpoint,
    writer: &mut Writer,
    max_pages: Option<u32>,
    pb: &ProgressBar,
) -> Result<RunSummary> {
    let clear = ClearOnDrop(pb);
    let client = ApiClient::new(settings)?;
    let page_size = client.page_size();
    let (tx, mut rx) = mpsc::channel::<Result<Page>>(CHANNEL_CAPACITY);

    let producer = tokio::spawn(async move {
        let mut page_no = 1u32;
        loop {
            let result = client.fetch_page(endpoint, page_no).await;
            let last = match &result {
                Ok(page) => page.is_last(page_size) || max_pages.is_some_and(|m| page_no >= m),
                Err(_) => true,
            };
            if tx.send(result).await.is_err() || last {
                break;
            }
            page_no += 1;
        }
    });

    let mut filter = RecordFilter::new(endpoint);
    let mut summary = RunSummary::default();

    while let Some(result) = rx.recv().await {
        let page = result?;
        if summary.pages == 0 {
            let mut total_pages = page.total_count.div_ceil(page_size as u64);
            if let Some(m) = max_pages {
                total_pages = total_pages.min(m as u64);
            }
            pb.set_length(total_pages.max(1));
        }
        let flow = process_page(&page, &mut filter, writer, &mut summary)?;
        pb.inc(1);
        pb.set_message(format!("{} records", summary.written));
        if flow == Flow::Repeated {
            warn!("{} page {} repeats earlier records, stopping", endpoint, page.page_no);
            break;
        }
    }
    drop(rx);
    if let Err(e) = producer.await {
        warn!("{} fetch task ended abnormally: {}", endpoint, e);
    }
    drop(clear);

    if !summary.error_report.is_empty() {
        let path = settings.error_report_path();
        write_json_atomic(&path, &summary.error_report)?;
        warn!(
            "{}: {} records kept {} label documents as plain text, see {}",
            endpoint,
            summary.error_report.len(),
            summary.doc_fallbacks,
            path.display()
        );
    }
    info!(
        "{}: {} pages, {} fetched, {} written, {} skipped",
        endpoint,
        summary.pages,
        summary.fetched,
        summary.written,
        summary.skipped()
    );
    Ok(summary)
}

/// Clean, filter and write one page. Cleaning runs to completion before
/// anything is written, so a malformed item leaves the writer untouched.
pub fn process_page(
    page: &Page,
    filter: &mut RecordFilter,
    writer: &mut Writer,
    summary: &mut RunSummary,
) -> Result<Flow> {
    let cleaned = clean_page(&page.items)?;
    summary.pages += 1;
    summary.fetched += cleaned.len();

    if !cleaned.is_empty() && filter.all_seen(cleaned.iter().map(|c| c.record.item_seq())) {
        return Ok(Flow::Repeated);
    }

    let mut batch = Vec::with_capacity(cleaned.len());
    for c in cleaned {
        match filter.admit(&c.record) {
            Admission::Keep => {
                if !c.issues.is_empty() {
                    for issue in &c.issues {
                        warn!(
                            "{}: {} did not parse, kept as plain text ({})",
                            c.record.item_seq(),
                            issue.field,
                            issue.error
                        );
                    }
                    summary.doc_fallbacks += c.issues.len();
                    summary.error_report.push(ReportEntry {
                        item_seq: c.record.item_seq().to_string(),
                        item_name: c.record.text("ITEM_NAME").to_string(),
                        error_fields: c.issues,
                    });
                }
                batch.push(c.record);
            }
            Admission::Cancelled => summary.skipped_cancelled += 1,
            Admission::ExportOnly => summary.skipped_export += 1,
            Admission::Duplicate => summary.skipped_duplicate += 1,
        }
    }
    writer.write_batch(&batch)?;
    summary.written += batch.len();
    debug!(
        "page {}: {} items, {} written",
        page.page_no,
        page.items.len(),
        batch.len()
    );
    Ok(Flow::Continue)
}
