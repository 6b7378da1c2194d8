//! Test doubles shared by notifier and poller tests.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{HttpClient, HttpError, HttpRequest, HttpResponse, SharedWriter};

/// Mock HTTP client answering from a script, then with a fallback.
#[derive(Debug)]
pub struct MockClient {
    responses: Mutex<Vec<Result<HttpResponse, HttpError>>>,
    fallback: http::StatusCode,
    requests: Mutex<Vec<HttpRequest>>,
    call_count: AtomicUsize,
}

impl MockClient {
    /// Answers with the scripted responses in order, then `200 OK`.
    pub fn new(responses: Vec<Result<HttpResponse, HttpError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            fallback: http::StatusCode::OK,
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Always answers `200 OK`.
    pub fn success() -> Self {
        Self::new(Vec::new())
    }

    /// Times out `failures` times, then succeeds.
    pub fn failing_then_success(failures: usize) -> Self {
        Self::new((0..failures).map(|_| Err(HttpError::Timeout)).collect())
    }

    /// Always answers with `status`.
    pub fn always(status: http::StatusCode) -> Self {
        Self {
            fallback: status,
            ..Self::new(Vec::new())
        }
    }

    /// Number of requests made.
    pub fn calls(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Requests made, in order.
    pub fn captured_requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests made to `host`.
    pub fn calls_to(&self, host: &str) -> usize {
        self.captured_requests()
            .iter()
            .filter(|r| r.url.host_str() == Some(host))
            .count()
    }
}

impl HttpClient for MockClient {
    async fn request(&self, req: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(req);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(HttpResponse::with_status(self.fallback))
        } else {
            responses.remove(0)
        }
    }
}

impl HttpClient for Arc<MockClient> {
    async fn request(&self, req: HttpRequest) -> Result<HttpResponse, HttpError> {
        (**self).request(req).await
    }
}

/// In-memory writer standing in for stdout.
#[derive(Debug, Clone, Default)]
pub struct CaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CaptureWriter {
    /// A shared writer plus a handle for reading what was written.
    pub fn shared() -> (SharedWriter, Self) {
        let capture = Self::default();
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(capture.clone())));
        (writer, capture)
    }

    /// Everything written so far, as lines.
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.buffer.lock().unwrap())
            .lines()
            .map(ToString::to_string)
            .collect()
    }
}

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
