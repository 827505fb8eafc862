use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use scraper::{Html, Selector};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{CollectError, Result};
use crate::record::{CleanRecord, Endpoint};
use crate::settings::Settings;
use crate::writer::{load_output, write_json_atomic};

pub const SEARCH_URL: &str = "https://nedrug.mfds.go.kr/searchDrug";
pub const DEFAULT_CONCURRENCY: usize = 10;
const REQUEST_TIMEOUT_SECS: u64 = 10;
const USER_AGENT: &str = "Mozilla/5.0";
const NO_RESULT_TEXT: &str = "조회 결과가 없습니다.";

static SPAN: LazyLock<Selector> = LazyLock::new(|| Selector::parse("span").unwrap());
static DETAIL_LINK: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"table.dr_table2 a[href*="getItemDetail?itemSeq="]"#).unwrap()
});

/// Whether the public drug search still lists an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Availability {
    Registered,
    NotRegistered,
    Unknown,
    Error(String),
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Availability::Registered => f.write_str("registered"),
            Availability::NotRegistered => f.write_str("not registered"),
            Availability::Unknown => f.write_str("unknown"),
            Availability::Error(e) => write!(f, "error: {}", e),
        }
    }
}

pub fn classify_html(html: &str) -> Availability {
    let doc = Html::parse_document(html);
    let no_result = doc
        .select(&SPAN)
        .any(|span| span.text().collect::<String>().trim() == NO_RESULT_TEXT);
    if no_result {
        Availability::NotRegistered
    } else if doc.select(&DETAIL_LINK).next().is_some() {
        Availability::Registered
    } else {
        Availability::Unknown
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct VerifySummary {
    pub checked: usize,
    pub registered: usize,
    pub not_registered: usize,
    pub unknown: usize,
    pub errors: usize,
}

impl VerifySummary {
    fn count(&mut self, status: &Availability) {
        self.checked += 1;
        match status {
            Availability::Registered => self.registered += 1,
            Availability::NotRegistered => self.not_registered += 1,
            Availability::Unknown => self.unknown += 1,
            Availability::Error(_) => self.errors += 1,
        }
    }
}

pub struct Verifier {
    http: reqwest::Client,
    search_url: String,
    concurrency: usize,
}

impl Verifier {
    pub fn new(search_url: impl Into<String>, concurrency: usize) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| CollectError::Config(format!("HTTP client: {}", e)))?;
        Ok(Verifier {
            http,
            search_url: search_url.into(),
            concurrency: concurrency.max(1),
        })
    }

    pub async fn check_one(&self, item_seq: &str) -> Availability {
        let request = self
            .http
            .get(&self.search_url)
            .query(&[("searchYn", "true"), ("itemSeq", item_seq)]);
        let html = match request.send().await {
            Ok(response) => match response.text().await {
                Ok(body) => body,
                Err(e) => return Availability::Error(e.to_string()),
            },
            Err(e) => return Availability::Error(e.to_string()),
        };
        classify_html(&html)
    }

    /// Check every record, at most `concurrency` requests at a time. The
    /// result keeps the input order.
    pub async fn check_all(self: Arc<Self>, records: &[CleanRecord]) -> Result<Vec<Availability>> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let (tx, mut rx) = mpsc::channel::<(usize, Availability)>(self.concurrency * 2);

        let pb = ProgressBar::new(records.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
                .map_err(|e| CollectError::Config(e.to_string()))?
                .progress_chars("=> "),
        );

        for (index, record) in records.iter().enumerate() {
            let verifier = Arc::clone(&self);
            let sem = Arc::clone(&semaphore);
            let tx = tx.clone();
            let item_seq = record.item_seq().to_string();

            tokio::spawn(async move {
                let status = match sem.acquire().await {
                    Ok(_permit) if item_seq.is_empty() => Availability::Error("missing ITEM_SEQ".into()),
                    Ok(_permit) => verifier.check_one(&item_seq).await,
                    Err(e) => Availability::Error(e.to_string()),
                };
                debug!("{}: {}", item_seq, status);
                let _ = tx.send((index, status)).await;
            });
        }
        drop(tx);

        let mut statuses = vec![Availability::Unknown; records.len()];
        while let Some((index, status)) = rx.recv().await {
            if let Availability::Error(e) = &status {
                warn!("{} check failed: {}", records[index].item_seq(), e);
            }
            statuses[index] = status;
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(statuses)
    }
}

/// Pick `n` records at random, or all of them when `n` is larger. The
/// sample keeps the input order.
pub fn sample_records(records: Vec<CleanRecord>, n: usize) -> Vec<CleanRecord> {
    if records.len() <= n {
        return records;
    }
    let mut picked = rand::seq::index::sample(&mut rand::rng(), records.len(), n).into_vec();
    picked.sort_unstable();
    let mut picked = picked.into_iter().peekable();
    records
        .into_iter()
        .enumerate()
        .filter(|(i, _)| picked.next_if_eq(i).is_some())
        .map(|(_, r)| r)
        .collect()
}

/// Check one endpoint's collected records against the public search and
/// write the registered ones to `<output_dir>/filtered/`.
pub async fn run(
    settings: &Settings,
    endpoint: Endpoint,
    search_url: &str,
    sample: Option<usize>,
    concurrency: usize,
) -> Result<VerifySummary> {
    let mut records = load_output(settings, endpoint)?;
    info!("Loaded {} {} records", records.len(), endpoint);
    if let Some(n) = sample {
        records = sample_records(records, n);
        info!("Checking a sample of {}", records.len());
    }

    let verifier = Arc::new(Verifier::new(search_url, concurrency)?);
    let statuses = verifier.check_all(&records).await?;

    let mut summary = VerifySummary::default();
    for status in &statuses {
        summary.count(status);
    }
    let registered: Vec<CleanRecord> = records
        .into_iter()
        .zip(&statuses)
        .filter(|(_, s)| **s == Availability::Registered)
        .map(|(r, _)| r)
        .collect();

    let target = filtered_path(settings, endpoint);
    write_json_atomic(&target, &registered)?;
    info!(
        "{}: {}/{} registered, written to {}",
        endpoint,
        summary.registered,
        summary.checked,
        target.display()
    );
    Ok(summary)
}

pub fn filtered_path(settings: &Settings, endpoint: Endpoint) -> std::path::PathBuf {
    settings
        .output_dir
        .join("filtered")
        .join(format!("{}.json", endpoint.table_name()))
}
