//! Web fetch tool: GET a URL with a timeout and a response size cap.

use serde::Serialize;

use ab_domain::config::WebConfig;
use ab_domain::error::{Error, Result};

#[derive(Debug, Clone, Serialize)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub body: String,
    pub truncated: bool,
}

pub async fn fetch(url: &str, cfg: &WebConfig) -> Result<FetchedPage> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(Error::Tool {
            tool: "web_fetch".into(),
            message: format!("unsupported URL scheme: {url}"),
        });
    }

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(cfg.timeout_s))
        .build()
        .map_err(|e| Error::Http(e.to_string()))?;

    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Http(e.to_string()))?;

    let status = resp.status().as_u16();
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let bytes = resp
        .bytes()
        .await
        .map_err(|e| Error::Http(e.to_string()))?;
    let truncated = bytes.len() > cfg.max_bytes;
    let slice = &bytes[..bytes.len().min(cfg.max_bytes)];
    let body = String::from_utf8_lossy(slice).to_string();

    Ok(FetchedPage {
        url: url.to_string(),
        status,
        content_type,
        body,
        truncated,
    })
}
