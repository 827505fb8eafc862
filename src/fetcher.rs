use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, warn};

use crate::error::{CollectError, Result};
use crate::record::{Endpoint, RawRecord};
use crate::settings::Settings;

const SNIPPET_CHARS: usize = 200;

/// Portal result codes that mean the key itself is the problem.
const AUTH_CODES: &[&str] = &["20", "21", "30", "31", "32", "33"];
const OK_CODE: &str = "00";
const NO_DATA_CODE: &str = "03";
const QUOTA_CODE: &str = "22";

/// One page of a paginated result set.
#[derive(Debug)]
pub struct Page {
    pub page_no: u32,
    pub total_count: u64,
    pub items: Vec<RawRecord>,
}

impl Page {
    /// Stop when the page is empty or short, or when the reported total has
    /// been covered. A missing `totalCount` leaves only the first two checks.
    pub fn is_last(&self, page_size: u32) -> bool {
        let n = self.items.len();
        n == 0
            || n < page_size as usize
            || (self.total_count > 0 && self.page_no as u64 * page_size as u64 >= self.total_count)
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    settings: Settings,
}

impl ApiClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        settings.require_api_key()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| CollectError::Config(format!("HTTP client: {}", e)))?;
        Ok(ApiClient {
            http,
            settings: settings.clone(),
        })
    }

    pub fn page_size(&self) -> u32 {
        self.settings.page_size
    }

    /// Fetch one page. Transient failures are retried only when
    /// `max_retries` is set; each retry is logged.
    pub async fn fetch_page(&self, endpoint: Endpoint, page_no: u32) -> Result<Page> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_once(endpoint, page_no).await {
                Err(e) if e.is_transient() && attempt < self.settings.max_retries => {
                    let delay = backoff(self.settings.retry_backoff_ms, attempt);
                    warn!(
                        "{} page {} failed ({}), attempt {}/{}, backing off {:.1}s",
                        endpoint,
                        page_no,
                        e,
                        attempt + 1,
                        self.settings.max_retries,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn fetch_once(&self, endpoint: Endpoint, page_no: u32) -> Result<Page> {
        let url = self.settings.endpoint_url(endpoint);
        debug!("GET {} pageNo={}", url, page_no);

        let page_no_param = page_no.to_string();
        let rows_param = self.settings.page_size.to_string();
        let response = self
            .http
            .get(url)
            .query(&[
                ("serviceKey", self.settings.api_key.as_str()),
                ("pageNo", page_no_param.as_str()),
                ("numOfRows", rows_param.as_str()),
                ("type", "xml"),
            ])
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!("{} page {}: HTTP {} ({} bytes)", endpoint, page_no, status, body.len());

        let mut page = parse_response(endpoint, status, &body)?;
        if page.page_no == 0 {
            page.page_no = page_no;
        }
        Ok(page)
    }
}

/// `base_ms * 2^attempt`, saturating instead of overflowing.
fn backoff(base_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(2u64.saturating_pow(attempt)))
}

/// Turn an HTTP status and body into a page or the matching error.
pub fn parse_response(endpoint: Endpoint, status: u16, body: &str) -> Result<Page> {
    if status == 401 || status == 403 {
        return Err(CollectError::Auth(format!("HTTP {}: {}", status, snippet(body))));
    }
    if body.contains("SERVICE_KEY_IS_NOT_REGISTERED") {
        return Err(CollectError::Auth(snippet(body)));
    }

    let success = (200..300).contains(&status);
    let envelope = match parse_envelope(endpoint, body) {
        Ok(env) => env,
        Err(_) if !success => {
            return Err(CollectError::Api {
                status,
                message: snippet(body),
            })
        }
        Err(e) => return Err(e),
    };

    if let Some(err) = envelope.service_error(status) {
        return Err(err);
    }
    if !success {
        return Err(CollectError::Api {
            status,
            message: snippet(body),
        });
    }
    Ok(Page {
        page_no: envelope.page_no.unwrap_or(0),
        total_count: envelope.total_count.unwrap_or(0),
        items: envelope.items,
    })
}

/// `parse_response` for a body that came back with HTTP 200.
#[cfg(test)]
pub fn parse_page(endpoint: Endpoint, body: &str) -> Result<Page> {
    parse_response(endpoint, 200, body)
}

#[derive(Debug, Default)]
struct Envelope {
    /// `<response>` (normal) or `<OpenAPI_ServiceResponse>` (gateway error).
    recognised: bool,
    result_code: Option<String>,
    result_msg: Option<String>,
    total_count: Option<u64>,
    page_no: Option<u32>,
    items: Vec<RawRecord>,
    reason_code: Option<String>,
    auth_msg: Option<String>,
    err_msg: Option<String>,
}

impl Envelope {
    fn service_error(&self, status: u16) -> Option<CollectError> {
        if let Some(code) = &self.reason_code {
            let msg = self
                .auth_msg
                .as_deref()
                .or(self.err_msg.as_deref())
                .unwrap_or("SERVICE ERROR");
            return Some(classify_code(code, msg, status));
        }
        let code = self.result_code.as_deref()?;
        if code == OK_CODE || code == NO_DATA_CODE {
            return None;
        }
        Some(classify_code(code, self.result_msg.as_deref().unwrap_or(""), status))
    }
}

fn classify_code(code: &str, msg: &str, status: u16) -> CollectError {
    let message = format!("{} ({})", msg, code);
    if AUTH_CODES.contains(&code) {
        CollectError::Auth(message)
    } else if code == QUOTA_CODE {
        CollectError::Api { status: 429, message }
    } else {
        CollectError::Api { status, message }
    }
}

fn parse_envelope(endpoint: Endpoint, body: &str) -> Result<Envelope> {
    let mut reader = Reader::from_str(body);
    let mut env = Envelope::default();
    let mut current: Option<Vec<u8>> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.name().as_ref() {
                b"item" => {
                    let inner = reader.read_text(e.name())?;
                    env.items.push(RawRecord {
                        endpoint,
                        xml: format!("<item>{}</item>", inner),
                    });
                }
                b"response" | b"OpenAPI_ServiceResponse" => env.recognised = true,
                name => current = Some(name.to_vec()),
            },
            Event::Text(t) => {
                let Some(name) = current.as_deref() else {
                    continue;
                };
                let value = t
                    .unescape()?
                    .trim()
                    .to_string();
                match name {
                    b"resultCode" => env.result_code = Some(value),
                    b"resultMsg" => env.result_msg = Some(value),
                    b"totalCount" => env.total_count = value.parse().ok(),
                    b"pageNo" => env.page_no = value.parse().ok(),
                    b"returnReasonCode" => env.reason_code = Some(value),
                    b"returnAuthMsg" => env.auth_msg = Some(value),
                    b"errMsg" => env.err_msg = Some(value),
                    _ => {}
                }
            }
            Event::End(_) => current = None,
            Event::Eof => break,
            _ => {}
        }
    }

    if !env.recognised {
        return Err(CollectError::Parse(format!(
            "unrecognised response: {}",
            snippet(body)
        )));
    }
    Ok(env)
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= SNIPPET_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(SNIPPET_CHARS).collect();
        format!("{}...", cut)
    }
}
