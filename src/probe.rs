//! Range-capability probe.
//!
//! Issues a conditional range request (`Range: bytes=0-`) against the job's
//! URL and classifies the response: 200 means full-content only, 206 means
//! the server honors byte ranges. `Accept-Encoding: identity` forces an
//! uncompressed, length-accurate reply. The transfer is aborted as soon as
//! body bytes arrive; a probe must never pull content.
//!
//! Read-only: the result is written into the job by the caller, not here.
//! Runs in the current thread; call from `spawn_blocking` in async code.

use std::str;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::DownloadConfig;
use crate::error::DownloadError;

/// Outcome of a successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    /// Total size in bytes, always positive.
    pub size: u64,
    /// True when the server answered 206 Partial Content.
    pub supports_ranges: bool,
}

/// Probe `url` and report size and range support.
pub fn probe(url: &str, config: &DownloadConfig) -> Result<ProbeResult, DownloadError> {
    let headers: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let headers_cb = Arc::clone(&headers);

    let mut easy = curl::easy::Easy::new();
    easy.url(url)?;
    easy.follow_location(true)?;
    easy.connect_timeout(Duration::from_millis(config.connect_timeout_ms))?;
    // Headers must arrive within the combined budget; the body is never read.
    easy.timeout(Duration::from_millis(
        config.connect_timeout_ms + config.read_timeout_ms,
    ))?;
    easy.accept_encoding("identity")?;
    easy.range("0-")?;
    if !config.method.eq_ignore_ascii_case("GET") {
        easy.custom_request(&config.method)?;
    }

    {
        let mut transfer = easy.transfer();
        transfer.header_function(move |data| {
            if let Ok(s) = str::from_utf8(data) {
                let line = s.trim_end();
                let mut headers = headers_cb.lock().unwrap();
                // A new status line starts a fresh header block (redirects).
                if line.starts_with("HTTP/") {
                    headers.clear();
                }
                headers.push(line.to_string());
            }
            true
        })?;
        // First body byte: refuse the write so curl aborts the transfer.
        transfer.write_function(|_data| Ok(0))?;
        if let Err(e) = transfer.perform() {
            // The forced write abort is the expected headers-only exit.
            if !e.is_write_error() {
                return Err(DownloadError::Transport(e.to_string()));
            }
        }
    }

    let status = easy.response_code().map_err(DownloadError::from)?;
    let transport_len = easy
        .content_length_download()
        .ok()
        .filter(|len| *len > 0.0)
        .map(|len| len as u64);

    let headers = headers.lock().unwrap();
    classify(status, &headers, transport_len)
}

/// Turns the response status, header lines and curl's transport-reported
/// length into a probe result.
fn classify(
    status: u32,
    headers: &[String],
    transport_len: Option<u64>,
) -> Result<ProbeResult, DownloadError> {
    let supports_ranges = match status {
        200 => false,
        206 => true,
        other => {
            return Err(DownloadError::RemoteFile(format!(
                "unsupported response status: {other}"
            )))
        }
    };

    let header_len = content_length(headers);
    let size = match header_len {
        Some(n) if n > 0 => Some(n),
        // Absent, zero or unparsable header: trust the transport.
        _ => transport_len,
    };

    match size {
        Some(n) if n > 0 => Ok(ProbeResult {
            size: n,
            supports_ranges,
        }),
        _ => Err(DownloadError::RemoteFile(
            "resolved file length is not positive".to_string(),
        )),
    }
}

fn content_length(headers: &[String]) -> Option<u64> {
    for line in headers {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse::<u64>().ok().filter(|n| *n > 0);
            }
        }
    }
    None
}
