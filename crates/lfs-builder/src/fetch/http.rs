use std::io::{Read, Write};
use std::time::Duration;

use tracing::debug;

use super::{FetchOutcome, Fetcher};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};

const CHUNK: usize = 64 * 1024;

/// Blocking HTTP(S) fetcher. The body is streamed in chunks so an interrupt
/// is seen mid-transfer and large archives never sit in memory.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    /// `timeout` bounds connecting and each wait for response data. The
    /// blocking client applies it per read, so a slow but steady transfer
    /// of a large tarball is never cut off while a stalled one fails.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, sink: &mut dyn Write, cancel: &CancelToken) -> FetchOutcome {
        let mut res = match self.client.get(url).send() {
            Ok(r) => r,
            Err(_) if cancel.is_cancelled() => return FetchOutcome::Cancelled,
            Err(e) => return FetchOutcome::Failed(format!("request failed: {e}")),
        };
        if !res.status().is_success() {
            return FetchOutcome::Failed(format!("HTTP status {}", res.status()));
        }

        let mut buf = vec![0u8; CHUNK];
        let mut total = 0u64;
        loop {
            if cancel.is_cancelled() {
                return FetchOutcome::Cancelled;
            }
            let n = match res.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) if cancel.is_cancelled() => return FetchOutcome::Cancelled,
                Err(e) => return FetchOutcome::Failed(format!("body read failed: {e}")),
            };
            if let Err(e) = sink.write_all(&buf[..n]) {
                return FetchOutcome::Failed(format!("write failed: {e}"));
            }
            total += n as u64;
        }
        debug!(url = %url, bytes = total, "transfer complete");
        FetchOutcome::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::path::PathBuf;
    use std::thread;

    fn spawn_http_file_server(
        root: PathBuf,
        request_limit: usize,
    ) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = thread::spawn(move || {
            for _ in 0..request_limit {
                let (mut stream, _) = listener.accept().expect("accept");
                let mut buf = [0u8; 8192];
                let n = stream.read(&mut buf).expect("read request");
                let req = String::from_utf8_lossy(&buf[..n]);
                let path = req
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or("/")
                    .to_string();
                let fpath = root.join(path.trim_start_matches('/'));
                if fpath.is_file() {
                    let body = fs::read(&fpath).expect("read fixture");
                    let hdr = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    stream.write_all(hdr.as_bytes()).expect("write hdr");
                    stream.write_all(&body).expect("write body");
                } else {
                    let _ = stream.write_all(
                        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    );
                }
            }
        });
        (format!("http://{}", addr), handle)
    }

    #[test]
    fn fetches_body_and_reports_missing_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("m4-1.4.19.tar.xz"), "m4 archive").expect("fixture");
        let (base, handle) = spawn_http_file_server(tmp.path().to_path_buf(), 2);

        let fetcher = HttpFetcher::new(Duration::from_secs(5)).expect("client");
        let mut out = Vec::new();
        let got = fetcher.fetch(
            &format!("{base}/m4-1.4.19.tar.xz"),
            &mut out,
            &CancelToken::new(),
        );
        assert_eq!(got, FetchOutcome::Complete);
        assert_eq!(out, b"m4 archive");

        let mut out = Vec::new();
        let got = fetcher.fetch(&format!("{base}/missing.tar.xz"), &mut out, &CancelToken::new());
        assert!(matches!(got, FetchOutcome::Failed(ref r) if r.contains("404")));

        handle.join().expect("server thread");
    }

    fn spawn_stalling_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = [0u8; 8192];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: close\r\n\r\nabc",
            );
            let _ = stream.flush();
            thread::sleep(Duration::from_secs(30));
        });
        format!("http://{}", addr)
    }

    #[test]
    fn stalled_body_fails_within_the_timeout() {
        let base = spawn_stalling_server();
        let fetcher = HttpFetcher::new(Duration::from_millis(500)).expect("client");
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let mut out = Vec::new();
            let got = fetcher.fetch(
                &format!("{base}/gcc-14.2.0.tar.xz"),
                &mut out,
                &CancelToken::new(),
            );
            let _ = tx.send(got);
        });
        let got = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("fetch returned while the server stalled");
        assert!(matches!(got, FetchOutcome::Failed(_)), "got {got:?}");
    }

    #[test]
    fn cancel_during_stall_ends_the_fetch() {
        let base = spawn_stalling_server();
        let fetcher = HttpFetcher::new(Duration::from_millis(500)).expect("client");
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let mut out = Vec::new();
            let got = fetcher.fetch(&format!("{base}/gcc-14.2.0.tar.xz"), &mut out, &remote);
            let _ = tx.send(got);
        });
        thread::sleep(Duration::from_millis(100));
        cancel.cancel();
        let got = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("fetch returned after cancel");
        assert_eq!(got, FetchOutcome::Cancelled);
    }

    #[test]
    fn cancelled_token_stops_before_writing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.tar"), "data").expect("fixture");
        let (base, handle) = spawn_http_file_server(tmp.path().to_path_buf(), 1);

        let fetcher = HttpFetcher::new(Duration::from_secs(5)).expect("client");
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut out = Vec::new();
        let got = fetcher.fetch(&format!("{base}/a.tar"), &mut out, &cancel);
        assert_eq!(got, FetchOutcome::Cancelled);
        assert!(out.is_empty());

        handle.join().expect("server thread");
    }
}
