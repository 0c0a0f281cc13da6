//! Throwaway HTTP/1.1 server for integration tests.
//!
//! Serves one static body per server. A `Range: bytes=X-Y` GET gets 206
//! Partial Content with the matching slice; without a Range header (or with
//! ranges disabled) the reply is 200 with the full body. An optional
//! per-chunk delay slows the body down so tests can pause a transfer while
//! it is demonstrably mid-flight.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// When false, Range headers are ignored and every GET gets 200 + full body.
    pub support_ranges: bool,
    /// When set, every request is answered with this status and no body.
    pub status_override: Option<u32>,
    /// Sleep inserted between body chunks, for pause-mid-transfer tests.
    pub chunk_delay: Option<Duration>,
    /// Body write granularity when a delay is set.
    pub chunk_size: usize,
    /// Extra bytes appended past a requested range end (clamped to the
    /// body), simulating a server that ignores the upper bound.
    pub range_overshoot: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            status_override: None,
            chunk_delay: None,
            chunk_size: 4096,
            range_overshoot: 0,
        }
    }
}

/// Serve `body` from a background thread; returns the URL of the resource.
/// The server lives until the test process exits.
pub fn start(body: Vec<u8>) -> String {
    start_with_options(body, ServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: ServerOptions) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            thread::spawn(move || handle(stream, &body, opts));
        }
    });
    format!("http://127.0.0.1:{port}/file.bin")
}

fn handle(mut stream: TcpStream, body: &[u8], opts: ServerOptions) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));

    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let Ok(request) = std::str::from_utf8(&buf[..n]) else {
        return;
    };
    let (method, range) = parse_request(request);

    if let Some(code) = opts.status_override {
        let _ = write!(stream, "HTTP/1.1 {code} Oops\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        return;
    }
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
        return;
    }

    let total = body.len() as u64;
    let (status_line, content_range, slice) = match range.filter(|_| opts.support_ranges) {
        Some((start, end)) => {
            let start = start.min(total);
            let mut end = end.min(total.saturating_sub(1));
            if opts.range_overshoot > 0 {
                end = (end + opts.range_overshoot).min(total.saturating_sub(1));
            }
            if start > end {
                let _ = write!(
                    stream,
                    "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{total}\r\nConnection: close\r\n\r\n"
                );
                return;
            }
            let slice = &body[start as usize..=end as usize];
            (
                "206 Partial Content",
                Some(format!("bytes {start}-{end}/{total}")),
                slice,
            )
        }
        None => ("200 OK", None, body),
    };

    let mut response = format!(
        "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\n",
        slice.len()
    );
    if let Some(cr) = content_range {
        response.push_str(&format!("Content-Range: {cr}\r\n"));
    }
    response.push_str("Connection: close\r\n\r\n");
    if stream.write_all(response.as_bytes()).is_err() {
        return;
    }

    match opts.chunk_delay {
        Some(delay) => {
            for chunk in slice.chunks(opts.chunk_size.max(1)) {
                if stream.write_all(chunk).is_err() {
                    return;
                }
                let _ = stream.flush();
                thread::sleep(delay);
            }
        }
        None => {
            let _ = stream.write_all(slice);
        }
    }
}

/// Returns the method and, when present, the `(start, end_inclusive)` pair
/// of a `Range: bytes=X-Y` header. An open-ended `X-` maps to the last byte.
fn parse_request(request: &str) -> (&str, Option<(u64, u64)>) {
    let mut lines = request.lines();
    let method = lines
        .next()
        .and_then(|l| l.split_whitespace().next())
        .unwrap_or("");
    let mut range = None;
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("range") {
            continue;
        }
        let value = value.trim();
        let Some(spec) = value.strip_prefix("bytes=") else {
            continue;
        };
        if let Some((a, b)) = spec.split_once('-') {
            let start = a.trim().parse::<u64>().unwrap_or(0);
            let end = match b.trim() {
                "" => u64::MAX,
                s => s.parse::<u64>().unwrap_or(0),
            };
            range = Some((start, end));
        }
    }
    (method, range)
}
