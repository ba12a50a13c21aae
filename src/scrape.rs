use rand::random;
use reqwest::{header, StatusCode};
use std::{error::Error, io::Read, net::IpAddr, thread::sleep, time::Duration};

use crate::config::ScrapeConfig;

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("blocked by url policy: {0}")]
    Blocked(String),

    #[error("http status {0}")]
    Status(u16),

    #[error("unsupported content type {0}")]
    NotHtml(String),

    #[error("response exceeds {0} bytes")]
    TooLarge(usize),

    #[error("request timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Request(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Errors that may go away when the same request is sent again.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for FetchError {
    fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Request(_) => true,
            FetchError::Status(code) => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

fn is_ip_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

fn is_private_host(host: &str) -> bool {
    use std::net::ToSocketAddrs;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return is_ip_private(&ip);
    }

    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    if let Ok(addrs) = (host, 80).to_socket_addrs() {
        for addr in addrs {
            if is_ip_private(&addr.ip()) {
                return true;
            }
        }
    }

    false
}

/// Rejects urls that must never be fetched on behalf of a user.
pub fn validate_url_policy(url: &reqwest::Url, config: &ScrapeConfig) -> Result<(), FetchError> {
    if !config.allowed_schemes.iter().any(|s| s == url.scheme()) {
        return Err(FetchError::Blocked(format!(
            "scheme '{}' not allowed",
            url.scheme()
        )));
    }

    let host = url.host_str().unwrap_or_default();
    if host.is_empty() {
        return Err(FetchError::InvalidUrl("missing host".to_string()));
    }

    if config.blocked_hosts.iter().any(|h| h.eq_ignore_ascii_case(host)) {
        return Err(FetchError::Blocked(format!("host '{host}' is blocked")));
    }

    if config.block_private_ips && is_private_host(host) {
        log::warn!("host '{host}' resolves to a private address");
        return Err(FetchError::Blocked(format!(
            "host '{host}' resolves to a private address"
        )));
    }

    Ok(())
}

fn get_error(error: &reqwest::Error) -> String {
    match error.source() {
        Some(e) => match e.source() {
            Some(e) => e.to_string(),
            None => e.to_string(),
        },
        None => error.to_string(),
    }
}

fn classify(error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Request(get_error(&error))
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * 2u64.pow(attempt - 1) + random::<u64>() % 250)
}

/// Runs `f` up to [`MAX_ATTEMPTS`] times while it fails with a transient error.
pub fn with_retries<T, E>(iden: &str, mut f: impl FnMut() -> Result<T, E>) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f() {
            Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                let delay = backoff(attempt);
                log::debug!("{iden}: {err}, retrying in {}ms", delay.as_millis());
                sleep(delay);
            }
            result => return result,
        }
    }
}

fn read_capped(resp: reqwest::blocking::Response, max_bytes: usize) -> Result<Vec<u8>, FetchError> {
    if let Some(len) = resp.content_length() {
        if len as usize > max_bytes {
            return Err(FetchError::TooLarge(max_bytes));
        }
    }

    let mut body = Vec::new();
    resp.take(max_bytes as u64 + 1)
        .read_to_end(&mut body)
        .map_err(|err| FetchError::Request(err.to_string()))?;

    if body.len() > max_bytes {
        return Err(FetchError::TooLarge(max_bytes));
    }

    Ok(body)
}

pub struct Fetcher {
    config: ScrapeConfig,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub html: String,
}

impl Fetcher {
    pub fn new(config: ScrapeConfig) -> Self {
        Fetcher { config }
    }

    fn client(&self) -> Result<reqwest::blocking::Client, FetchError> {
        let policy_config = self.config.clone();
        reqwest::blocking::Client::builder()
            .user_agent(&self.config.user_agent)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .pool_idle_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::custom(move |attempt| {
                if attempt.previous().len() >= 5 {
                    attempt.error("too many redirects")
                } else if validate_url_policy(attempt.url(), &policy_config).is_err() {
                    attempt.stop()
                } else {
                    attempt.follow()
                }
            }))
            .build()
            .map_err(|err| FetchError::Request(get_error(&err)))
    }

    /// Fetches an HTML document, enforcing the url policy, timeout and size cap.
    pub fn fetch_html(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let parsed =
            reqwest::Url::parse(url).map_err(|err| FetchError::InvalidUrl(err.to_string()))?;
        validate_url_policy(&parsed, &self.config)?;

        let iden = format!("{}{}", parsed.host_str().unwrap_or_default(), parsed.path());
        let client = self.client()?;

        with_retries(&iden, || {
            log::debug!("{iden}: requesting");
            let resp = client.get(parsed.clone()).send().map_err(classify)?;

            let status = resp.status();
            if status != StatusCode::OK {
                return Err(FetchError::Status(status.as_u16()));
            }

            let content_type = resp
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_lowercase();
            if !content_type.is_empty()
                && !content_type.contains("html")
                && !content_type.contains("xml")
            {
                return Err(FetchError::NotHtml(content_type));
            }

            let final_url = resp.url().to_string();
            let body = read_capped(resp, self.config.max_content_bytes)?;

            Ok(FetchedPage {
                url: final_url,
                html: String::from_utf8_lossy(&body).to_string(),
            })
        })
    }

    /// Asks the reader-mode proxy for a readable rendition of `url`.
    pub fn fetch_reader(&self, url: &str) -> Result<ReaderPage, FetchError> {
        let reader_url = self
            .config
            .reader_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| FetchError::Blocked("no reader configured".to_string()))?;

        let parsed =
            reqwest::Url::parse(url).map_err(|err| FetchError::InvalidUrl(err.to_string()))?;
        validate_url_policy(&parsed, &self.config)?;

        let encoded: String = url::form_urlencoded::byte_serialize(url.as_bytes()).collect();
        let endpoint = format!("{}/{encoded}", reader_url.trim_end_matches('/'));
        let client = self.client()?;

        with_retries(&endpoint, || {
            let mut req = client
                .get(&endpoint)
                .header(header::ACCEPT, "application/json");
            if let Some(key) = &self.config.reader_api_key {
                req = req.bearer_auth(key);
            }

            let resp = req.send().map_err(classify)?;
            if !resp.status().is_success() {
                return Err(FetchError::Status(resp.status().as_u16()));
            }

            let body = read_capped(resp, self.config.max_content_bytes)?;
            let parsed: ReaderResponse = serde_json::from_slice(&body)
                .map_err(|err| FetchError::Malformed(err.to_string()))?;

            Ok(parsed.data)
        })
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ReaderPage {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct ReaderResponse {
    #[serde(default)]
    data: ReaderPage,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> reqwest::Url {
        reqwest::Url::parse(s).unwrap()
    }

    #[test]
    fn test_private_hosts_are_blocked() {
        let config = ScrapeConfig::default();

        assert!(validate_url_policy(&url("http://127.0.0.1/admin"), &config).is_err());
        assert!(validate_url_policy(&url("http://10.0.0.8/"), &config).is_err());
        assert!(validate_url_policy(&url("http://192.168.1.1/"), &config).is_err());
        assert!(validate_url_policy(&url("http://[::1]/"), &config).is_err());
        assert!(validate_url_policy(&url("http://localhost:8080/"), &config).is_err());
        assert!(validate_url_policy(&url("http://93.184.216.34/"), &config).is_ok());
    }

    #[test]
    fn test_scheme_and_host_lists() {
        let mut config = ScrapeConfig::default();
        config.blocked_hosts.push("evil.test".to_string());

        assert!(matches!(
            validate_url_policy(&url("file:///etc/passwd"), &config),
            Err(FetchError::Blocked(_)) | Err(FetchError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url_policy(&url("https://evil.test/x"), &config),
            Err(FetchError::Blocked(_))
        ));
    }

    #[test]
    fn test_private_ips_allowed_when_policy_disabled() {
        let config = ScrapeConfig {
            block_private_ips: false,
            ..Default::default()
        };
        assert!(validate_url_policy(&url("http://127.0.0.1/"), &config).is_ok());
    }

    #[test]
    fn test_retries_only_transient_errors() {
        let mut calls = 0;
        let result: Result<(), FetchError> = with_retries("test", || {
            calls += 1;
            Err(FetchError::Status(404))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);

        let mut calls = 0;
        let result: Result<u32, FetchError> = with_retries("test", || {
            calls += 1;
            if calls < 2 {
                Err(FetchError::Status(503))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }
}
