//! The cloud synchronization client. One client owns the socket pool (via
//! its dialer), the bearer credential, and a single full-jitter backoff
//! gate shared by every request path: telemetry, events, heartbeat,
//! configuration and OTA.

use crate::auth::{self, AuthState};
use crate::error::{RetryCause, SyncError, SyncResult};
use crate::http::{self, Request, Response};
use crate::net::Dialer;
use flint::backoff::Backoff;
use flint::logging::{self, Logger};
use flint::time::{Clock, Deadline};
use serde_derive::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use strata::fs::Volume;
use strata::{SegmentKind, Store};

const HANDSHAKE_PATH: &str = "/api/iot/v1/auth/handshake";
const TELEMETRY_PATH: &str = "/api/iot/v1/telemetry/batch";
const EVENT_PATH: &str = "/api/iot/v1/event/batch";
const CONFIG_PATH: &str = "/api/iot/v1/config";
const OTA_CHECK_PATH: &str = "/api/iot/v1/ota/check";
const OTA_REPORT_PATH: &str = "/api/iot/v1/ota/report";
const HEARTBEAT_PATH: &str = "/api/iot/v1/heartbeat";

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub server_host: String,
    pub server_port: u16,
    /// Carried for the dialer's benefit; the client itself is agnostic to
    /// what wraps the byte stream.
    pub use_https: bool,
    pub device_id: String,
    pub request_timeout: Duration,
    pub max_batch_records: usize,
    /// How many times a 400-class rejection is retried before the batch is
    /// dropped and the cursor advanced past it.
    pub reject_attempts: u8,
}

impl Default for SyncConfig {
    fn default() -> SyncConfig {
        SyncConfig {
            server_host: "localhost".to_string(),
            server_port: 443,
            use_https: true,
            device_id: "edge-0000".to_string(),
            request_timeout: Duration::from_secs(30),
            max_batch_records: 64,
            reject_attempts: 3,
        }
    }
}

#[derive(Debug, Default, Copy, Clone)]
pub struct SyncStats {
    pub batches_sent: u64,
    pub batches_acked: u64,
    pub batches_dropped: u64,
    pub records_uploaded: u64,
    pub bytes_uploaded: u64,
    pub retries: u64,
    pub auth_rotations: u64,
    pub heartbeats_sent: u64,
    pub ota_reports_sent: u64,
    pub config_fetches: u64,
}

/// What one sync step did.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SyncOutcome {
    /// Nothing to upload.
    Idle,
    Uploaded { batch_id: u64, records: usize },
    /// Backoff gate closed or a retryable failure occurred; nothing was
    /// committed and the batch id is preserved for the next attempt.
    Deferred,
    /// The server refused the batch as malformed too many times; the
    /// cursor advanced past it.
    Dropped { batch_id: u64, status: u16 },
    /// Credential rejected; uploads stay paused until a handshake succeeds.
    Paused,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OtaStatus {
    UpToDate,
    UpdateAvailable(UpdateDescriptor),
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct UpdateDescriptor {
    pub version: String,
    pub url: String,
    pub sha256: String,
    pub size: u64,
}

#[derive(Deserialize)]
struct OtaCheckResponse {
    #[serde(default)]
    up_to_date: bool,
    version: Option<String>,
    url: Option<String>,
    sha256: Option<String>,
    size: Option<u64>,
}

#[derive(Serialize)]
struct HeartbeatBody<'a> {
    status: &'a str,
    timestamp: u64,
}

#[derive(Serialize)]
struct OtaReportBody<'a> {
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    timestamp: u64,
}

pub struct SyncClient<D: Dialer> {
    config: SyncConfig,
    dialer: D,
    auth: AuthState,
    backoff: Backoff,
    /// Gate shared by every request path; closed until this instant after
    /// a retryable failure.
    next_attempt: Option<Instant>,
    /// 400-class strikes against the current outstanding batch.
    reject_strikes: u8,
    stats: SyncStats,
    log: Logger,
}

impl<D: Dialer> SyncClient<D> {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        config: SyncConfig,
        dialer: D,
        log: L,
    ) -> SyncClient<D> {
        SyncClient {
            config,
            dialer,
            auth: AuthState::new(),
            backoff: Backoff::with_full_jitter(BACKOFF_BASE, BACKOFF_CAP),
            next_attempt: None,
            reject_strikes: 0,
            stats: SyncStats::default(),
            log: logging::branch(log),
        }
    }

    #[inline]
    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    /// Forces credential rotation on the next step (server-pushed config
    /// updates use this).
    pub fn invalidate_credential(&mut self) {
        self.auth.invalidate();
    }

    /// Installs a pre-provisioned key as the starting credential. A 401
    /// still rotates it through the normal handshake.
    pub fn preload_token(&mut self, token: &str) {
        self.auth.install(crate::auth::Credential {
            token: token.to_string(),
            expires_at: 0,
        });
    }

    #[inline]
    fn gated(&self, now: Instant) -> bool {
        self.next_attempt
            .map(|instant| now < instant)
            .unwrap_or(false)
    }

    fn close_gate<C: Clock>(&mut self, clock: &C) {
        let delay = self.backoff.next_delay();
        self.next_attempt = Some(clock.now() + delay);
        self.stats.retries += 1;

        logging::debug!(self.log, "backing off";
                        "context" => "gate",
                        "delay_ms" => delay.as_millis() as u64,
                        "attempt" => self.backoff.attempt());
    }

    fn open_gate(&mut self) {
        self.backoff.reset();
        self.next_attempt = None;
    }

    /// One cooperative sync step: uploads at most one batch of the given
    /// kind. Never blocks past the request timeout.
    pub fn sync_step<V: Volume, C: Clock>(
        &mut self,
        store: &mut Store<V>,
        kind: SegmentKind,
        clock: &C,
    ) -> SyncResult<SyncOutcome> {
        if self.gated(clock.now()) {
            return Ok(SyncOutcome::Deferred);
        }

        if !self.auth.is_authenticated() {
            match self.authenticate(clock) {
                Ok(()) => (),
                Err(SyncError::Retryable(_)) | Err(SyncError::AuthRequired) => {
                    self.close_gate(clock);
                    return Ok(SyncOutcome::Paused);
                }
                Err(fatal) => return Err(fatal),
            }
        }

        let batch = match store.peek(kind, self.config.max_batch_records)? {
            Some(batch) => batch,
            None => return Ok(SyncOutcome::Idle),
        };

        let body = store.encode_batch(&batch)?;
        let path = match kind {
            SegmentKind::Event => EVENT_PATH,
            _ => TELEMETRY_PATH,
        };

        let headers = vec![
            ("Content-Type", "application/zstd".to_string()),
            ("X-Batch-Id", batch.batch_id.to_string()),
        ];

        self.stats.batches_sent += 1;

        let response = match self.exchange(clock, "POST", path, headers, &body, true) {
            Ok(response) => response,
            Err(SyncError::Retryable(cause)) => {
                logging::warn!(self.log, "upload failed, will retry";
                               "context" => "sync",
                               "batch_id" => batch.batch_id,
                               "cause" => ?cause);
                self.close_gate(clock);
                return Ok(SyncOutcome::Deferred);
            }
            Err(err) => return Err(err),
        };

        match response.status {
            status if (200..300).contains(&status) => {
                store.advance(batch.batch_id)?;
                self.open_gate();
                self.reject_strikes = 0;
                self.stats.batches_acked += 1;
                self.stats.records_uploaded += batch.records.len() as u64;
                self.stats.bytes_uploaded += body.len() as u64;

                logging::info!(self.log, "batch acknowledged";
                               "context" => "sync",
                               "batch_id" => batch.batch_id,
                               "records" => batch.records.len(),
                               "status" => status);

                Ok(SyncOutcome::Uploaded {
                    batch_id: batch.batch_id,
                    records: batch.records.len(),
                })
            }
            401 | 403 => {
                logging::warn!(self.log, "credential rejected, pausing uploads";
                               "context" => "sync", "status" => response.status);
                self.auth.invalidate();
                self.close_gate(clock);
                Ok(SyncOutcome::Paused)
            }
            408 | 429 => {
                self.close_gate(clock);
                Ok(SyncOutcome::Deferred)
            }
            status if (400..500).contains(&status) => {
                self.reject_strikes += 1;

                if self.reject_strikes >= self.config.reject_attempts {
                    // Malformed client data is not retried endlessly
                    store.advance(batch.batch_id)?;
                    self.reject_strikes = 0;
                    self.stats.batches_dropped += 1;

                    logging::error!(self.log, "batch dropped after repeated rejection";
                                    "context" => "sync",
                                    "batch_id" => batch.batch_id,
                                    "status" => status);

                    Ok(SyncOutcome::Dropped {
                        batch_id: batch.batch_id,
                        status,
                    })
                } else {
                    logging::warn!(self.log, "batch rejected";
                                   "context" => "sync",
                                   "batch_id" => batch.batch_id,
                                   "status" => status,
                                   "strikes" => self.reject_strikes);
                    self.close_gate(clock);
                    Ok(SyncOutcome::Deferred)
                }
            }
            status => {
                // 5xx and anything unexpected: retry with backoff,
                // preserving the batch id
                self.close_gate(clock);

                logging::warn!(self.log, "server error, will retry";
                               "context" => "sync",
                               "batch_id" => batch.batch_id,
                               "status" => status);

                Ok(SyncOutcome::Deferred)
            }
        }
    }

    /// Posts the device identity and installs the bearer credential the
    /// backend hands back.
    pub fn authenticate<C: Clock>(&mut self, clock: &C) -> SyncResult<()> {
        let body = auth::handshake_body(&self.config.device_id, clock.timestamp_secs())?;

        let response = self.exchange(
            clock,
            "POST",
            HANDSHAKE_PATH,
            vec![("Content-Type", "application/json".to_string())],
            &body,
            false,
        )?;

        if !response.is_success() {
            logging::warn!(self.log, "handshake refused";
                           "context" => "auth", "status" => response.status);
            return Err(SyncError::Retryable(RetryCause::Status(response.status)));
        }

        let credential = auth::parse_handshake(&response.body)?;

        logging::info!(self.log, "credential installed";
                       "context" => "auth",
                       "token" => auth::protect_token(&credential.token),
                       "expires_at" => credential.expires_at);

        self.auth.install(credential);
        self.stats.auth_rotations += 1;

        Ok(())
    }

    /// Low-priority liveness signal sharing the credential and backoff
    /// gate with the upload path. Returns whether the beat went out.
    pub fn heartbeat<C: Clock>(&mut self, clock: &C, status: &str) -> SyncResult<bool> {
        if self.gated(clock.now()) {
            return Ok(false);
        }

        if !self.auth.is_authenticated() {
            return Ok(false);
        }

        let body = serde_json::to_vec(&HeartbeatBody {
            status,
            timestamp: clock.timestamp_secs(),
        })
        .map_err(|_| SyncError::Fatal(crate::error::FatalCause::BadPayload))?;

        match self.post_json(clock, HEARTBEAT_PATH, &body)? {
            Some(_) => {
                self.stats.heartbeats_sent += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Asks the backend whether a newer firmware exists for `version`.
    pub fn ota_check<C: Clock>(&mut self, clock: &C, version: &str) -> SyncResult<Option<OtaStatus>> {
        if self.gated(clock.now()) || !self.auth.is_authenticated() {
            return Ok(None);
        }

        let path = format!("{}?version={}", OTA_CHECK_PATH, version);

        let response = match self.exchange(clock, "GET", &path, Vec::new(), &[], true) {
            Ok(response) => response,
            Err(SyncError::Retryable(_)) => {
                self.close_gate(clock);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        if response.status == 401 || response.status == 403 {
            self.auth.invalidate();
            self.close_gate(clock);
            return Ok(None);
        }

        if !response.is_success() {
            self.close_gate(clock);
            return Ok(None);
        }

        let parsed: OtaCheckResponse = serde_json::from_slice(&response.body)
            .map_err(|_| SyncError::Fatal(crate::error::FatalCause::BadPayload))?;

        if parsed.up_to_date {
            return Ok(Some(OtaStatus::UpToDate));
        }

        match (parsed.version, parsed.url, parsed.sha256, parsed.size) {
            (Some(version), Some(url), Some(sha256), Some(size)) => {
                Ok(Some(OtaStatus::UpdateAvailable(UpdateDescriptor {
                    version,
                    url,
                    sha256,
                    size,
                })))
            }
            _ => Err(SyncError::Fatal(crate::error::FatalCause::BadPayload)),
        }
    }

    /// Reports OTA progress or failure.
    pub fn ota_report<C: Clock>(
        &mut self,
        clock: &C,
        status: &str,
        error: Option<&str>,
    ) -> SyncResult<bool> {
        if self.gated(clock.now()) || !self.auth.is_authenticated() {
            return Ok(false);
        }

        let body = serde_json::to_vec(&OtaReportBody {
            status,
            error,
            timestamp: clock.timestamp_secs(),
        })
        .map_err(|_| SyncError::Fatal(crate::error::FatalCause::BadPayload))?;

        match self.post_json(clock, OTA_REPORT_PATH, &body)? {
            Some(_) => {
                self.stats.ota_reports_sent += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pulls the opaque configuration blob; the caller hands it to the
    /// configuration collaborator.
    pub fn fetch_config<C: Clock>(&mut self, clock: &C) -> SyncResult<Option<Vec<u8>>> {
        if self.gated(clock.now()) || !self.auth.is_authenticated() {
            return Ok(None);
        }

        let response = match self.exchange(clock, "GET", CONFIG_PATH, Vec::new(), &[], true) {
            Ok(response) => response,
            Err(SyncError::Retryable(_)) => {
                self.close_gate(clock);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        if response.status == 401 || response.status == 403 {
            self.auth.invalidate();
            self.close_gate(clock);
            return Ok(None);
        }

        if !response.is_success() {
            self.close_gate(clock);
            return Ok(None);
        }

        self.stats.config_fetches += 1;
        Ok(Some(response.body))
    }

    /// Shared JSON-POST plumbing for the low-priority paths. `None` means
    /// the request did not get through and the gate has been closed.
    fn post_json<C: Clock>(
        &mut self,
        clock: &C,
        path: &str,
        body: &[u8],
    ) -> SyncResult<Option<Response>> {
        let headers = vec![("Content-Type", "application/json".to_string())];

        let response = match self.exchange(clock, "POST", path, headers, body, true) {
            Ok(response) => response,
            Err(SyncError::Retryable(_)) => {
                self.close_gate(clock);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        match response.status {
            status if (200..300).contains(&status) => Ok(Some(response)),
            401 | 403 => {
                self.auth.invalidate();
                self.close_gate(clock);
                Ok(None)
            }
            _ => {
                self.close_gate(clock);
                Ok(None)
            }
        }
    }

    fn exchange<C: Clock>(
        &mut self,
        clock: &C,
        method: &str,
        path: &str,
        mut headers: Vec<(&str, String)>,
        body: &[u8],
        with_auth: bool,
    ) -> SyncResult<Response> {
        if with_auth {
            let token = self.auth.bearer().ok_or(SyncError::AuthRequired)?;
            headers.push(("Authorization", format!("Bearer {}", token)));
        }

        let deadline = Deadline::after(clock.now(), self.config.request_timeout);

        let mut stream =
            self.dialer
                .connect(&self.config.server_host, self.config.server_port, deadline)?;

        crate::net::NetStream::set_deadline(&mut stream, deadline)?;

        http::write_request(
            &mut stream,
            &self.config.server_host,
            &Request {
                method,
                path,
                headers,
                body,
            },
        )?;

        http::read_response(&mut stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NetStream;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::rc::Rc;
    use strata::fs::MemVolume;
    use strata::{Priority, Record, StoreConfig};

    const NOW_SECS: u64 = 1_700_000_000;

    #[derive(Clone)]
    struct TestClock {
        now: Rc<Cell<Instant>>,
    }

    impl TestClock {
        fn new() -> TestClock {
            TestClock {
                now: Rc::new(Cell::new(Instant::now())),
            }
        }

        fn advance(&self, duration: Duration) {
            self.now.set(self.now.get() + duration);
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.now.get()
        }

        fn timestamp_secs(&self) -> u64 {
            NOW_SECS
        }

        fn sleep(&self, duration: Duration) {
            self.advance(duration);
        }
    }

    /// One scripted connection: the canned response is served for reading,
    /// everything written is captured for inspection.
    struct MockStream {
        response: io::Cursor<Vec<u8>>,
        written: Rc<RefCell<Vec<u8>>>,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.response.read(buf)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl NetStream for MockStream {
        fn set_deadline(&mut self, _deadline: Deadline) -> io::Result<()> {
            Ok(())
        }
    }

    /// Scripted dialer: each connect consumes one canned response; an
    /// exhausted script refuses the connection (a network error). Every
    /// connection's written bytes stay observable through `requests`.
    struct MockDialer {
        script: VecDeque<Vec<u8>>,
        requests: Vec<Rc<RefCell<Vec<u8>>>>,
    }

    impl MockDialer {
        fn new() -> MockDialer {
            MockDialer {
                script: VecDeque::new(),
                requests: Vec::new(),
            }
        }

        fn queue(&mut self, response: Vec<u8>) {
            self.script.push_back(response);
        }
    }

    impl Dialer for MockDialer {
        type Stream = MockStream;

        fn connect(&mut self, _host: &str, _port: u16, _deadline: Deadline) -> io::Result<MockStream> {
            match self.script.pop_front() {
                Some(response) => {
                    let written = Rc::new(RefCell::new(Vec::new()));
                    self.requests.push(Rc::clone(&written));

                    Ok(MockStream {
                        response: io::Cursor::new(response),
                        written,
                    })
                }
                None => Err(io::ErrorKind::ConnectionRefused.into()),
            }
        }
    }

    fn ok_json(body: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes()
    }

    fn status_only(status: u16, reason: &str) -> Vec<u8> {
        format!("HTTP/1.1 {} {}\r\nContent-Length: 0\r\n\r\n", status, reason).into_bytes()
    }

    fn handshake_ok() -> Vec<u8> {
        ok_json(r#"{"token":"tok-first","expires_at":1700003600}"#)
    }

    fn store_with_records(count: u32) -> Store<MemVolume> {
        let mut store = Store::open(
            MemVolume::new(),
            StoreConfig {
                enable_compression: false,
                ..StoreConfig::default()
            },
            NOW_SECS,
            None,
        )
        .unwrap();

        for sequence in 0..count {
            store
                .append(
                    SegmentKind::Data,
                    &Record {
                        timestamp: NOW_SECS as u32,
                        sequence,
                        source: 3,
                        priority: Priority::Normal,
                        flags: 0,
                        metadata: String::new(),
                        payload: vec![sequence as u8; 24],
                    },
                    NOW_SECS,
                )
                .unwrap();
        }

        store.rotate_for_upload(SegmentKind::Data).unwrap();
        store
    }

    fn client(dialer: MockDialer) -> SyncClient<MockDialer> {
        SyncClient::new(
            SyncConfig {
                server_host: "cloud.example.com".to_string(),
                server_port: 8443,
                device_id: "edge-0042".to_string(),
                request_timeout: Duration::from_secs(5),
                reject_attempts: 2,
                ..SyncConfig::default()
            },
            dialer,
            None,
        )
    }

    fn requests(client: &SyncClient<MockDialer>) -> Vec<String> {
        client
            .dialer
            .requests
            .iter()
            .map(|raw| String::from_utf8_lossy(&raw.borrow()).into_owned())
            .collect()
    }

    #[test]
    fn test_successful_upload_advances_cursor() {
        let mut dialer = MockDialer::new();
        dialer.queue(handshake_ok());
        dialer.queue(status_only(200, "OK"));

        let mut store = store_with_records(3);
        let mut client = client(dialer);
        let clock = TestClock::new();

        let outcome = client.sync_step(&mut store, SegmentKind::Data, &clock).unwrap();

        match outcome {
            SyncOutcome::Uploaded { records, .. } => assert_eq!(records, 3),
            outcome => panic!("Unexpected outcome {:?}", outcome),
        }

        assert_eq!(client.stats().batches_acked, 1);
        assert_eq!(client.stats().records_uploaded, 3);

        // Cursor moved exactly past the three records
        assert_eq!(store.peek(SegmentKind::Data, 10).unwrap(), None);
    }

    #[test]
    fn test_retry_preserves_batch_id() {
        let mut dialer = MockDialer::new();
        dialer.queue(handshake_ok());
        dialer.queue(status_only(503, "Service Unavailable"));
        dialer.queue(status_only(200, "OK"));

        let mut store = store_with_records(3);
        let mut client = client(dialer);
        let clock = TestClock::new();

        let first = client.sync_step(&mut store, SegmentKind::Data, &clock).unwrap();
        assert_eq!(first, SyncOutcome::Deferred);

        // Gate closed: an immediate step does nothing
        assert_eq!(
            client.sync_step(&mut store, SegmentKind::Data, &clock).unwrap(),
            SyncOutcome::Deferred
        );

        clock.advance(Duration::from_secs(2));

        let second = client.sync_step(&mut store, SegmentKind::Data, &clock).unwrap();
        match second {
            SyncOutcome::Uploaded { records, .. } => assert_eq!(records, 3),
            outcome => panic!("Unexpected outcome {:?}", outcome),
        }

        let sent = requests(&client);
        let first_id = extract_header(&sent[1], "x-batch-id");
        let second_id = extract_header(&sent[2], "x-batch-id");

        assert_eq!(first_id, second_id);
        assert_eq!(client.stats().retries, 1);
    }

    #[test]
    fn test_auth_rotation_on_401() {
        let mut dialer = MockDialer::new();
        dialer.queue(handshake_ok());
        dialer.queue(status_only(401, "Unauthorized"));
        dialer.queue(ok_json(r#"{"token":"tok-second","expires_at":1700007200}"#));
        dialer.queue(status_only(200, "OK"));

        let mut store = store_with_records(3);
        let mut client = client(dialer);
        let clock = TestClock::new();

        // First step: handshake + upload rejected with 401 → paused
        let outcome = client.sync_step(&mut store, SegmentKind::Data, &clock).unwrap();
        assert_eq!(outcome, SyncOutcome::Paused);
        assert!(!client.is_authenticated());

        clock.advance(Duration::from_secs(2));

        // Second step: fresh handshake, then the batch goes through
        let outcome = client.sync_step(&mut store, SegmentKind::Data, &clock).unwrap();
        match outcome {
            SyncOutcome::Uploaded { records, .. } => assert_eq!(records, 3),
            outcome => panic!("Unexpected outcome {:?}", outcome),
        }

        let sent = requests(&client);

        // No records dropped, no double upload, and the bearer rotated
        assert_eq!(client.stats().batches_dropped, 0);
        assert_eq!(client.stats().batches_acked, 1);
        assert_eq!(client.stats().auth_rotations, 2);
        assert!(sent[1].contains("Bearer tok-first"));
        assert!(sent[3].contains("Bearer tok-second"));

        let first_id = extract_header(&sent[1], "x-batch-id");
        let retry_id = extract_header(&sent[3], "x-batch-id");
        assert_eq!(first_id, retry_id);
    }

    #[test]
    fn test_bad_request_dropped_after_bounded_attempts() {
        let mut dialer = MockDialer::new();
        dialer.queue(handshake_ok());
        dialer.queue(status_only(400, "Bad Request"));
        dialer.queue(status_only(400, "Bad Request"));

        let mut store = store_with_records(2);
        let mut client = client(dialer);
        let clock = TestClock::new();

        assert_eq!(
            client.sync_step(&mut store, SegmentKind::Data, &clock).unwrap(),
            SyncOutcome::Deferred
        );

        clock.advance(Duration::from_secs(2));

        match client.sync_step(&mut store, SegmentKind::Data, &clock).unwrap() {
            SyncOutcome::Dropped { status, .. } => assert_eq!(status, 400),
            outcome => panic!("Unexpected outcome {:?}", outcome),
        }

        assert_eq!(client.stats().batches_dropped, 1);
        assert_eq!(store.peek(SegmentKind::Data, 10).unwrap(), None);
    }

    #[test]
    fn test_network_error_defers_without_advancing() {
        let mut dialer = MockDialer::new();
        dialer.queue(handshake_ok());
        // No upload response queued: the connect is refused

        let mut store = store_with_records(1);
        let mut client = client(dialer);
        let clock = TestClock::new();

        assert_eq!(
            client.sync_step(&mut store, SegmentKind::Data, &clock).unwrap(),
            SyncOutcome::Deferred
        );

        // The batch is still there for the next attempt
        clock.advance(Duration::from_secs(2));
        assert!(store.peek(SegmentKind::Data, 10).unwrap().is_some());
    }

    #[test]
    fn test_heartbeat_posts_status_and_timestamp() {
        let mut dialer = MockDialer::new();
        dialer.queue(handshake_ok());
        dialer.queue(status_only(200, "OK"));

        let mut client = client(dialer);
        let clock = TestClock::new();

        client.authenticate(&clock).unwrap();
        assert!(client.heartbeat(&clock, "online").unwrap());

        let sent = requests(&client);
        assert!(sent[1].contains("POST /api/iot/v1/heartbeat"));
        assert!(sent[1].contains(r#""status":"online""#));
        assert!(sent[1].contains(&format!(r#""timestamp":{}"#, NOW_SECS)));
        assert_eq!(client.stats().heartbeats_sent, 1);
    }

    #[test]
    fn test_ota_check_parses_both_shapes() {
        let mut dialer = MockDialer::new();
        dialer.queue(handshake_ok());
        dialer.queue(ok_json(r#"{"up_to_date":true}"#));
        dialer.queue(ok_json(
            r#"{"version":"2.1.0","url":"https://cdn.example.com/fw.bin","sha256":"ab12","size":524288}"#,
        ));

        let mut client = client(dialer);
        let clock = TestClock::new();

        client.authenticate(&clock).unwrap();

        assert_eq!(
            client.ota_check(&clock, "2.0.0").unwrap(),
            Some(OtaStatus::UpToDate)
        );

        match client.ota_check(&clock, "2.0.0").unwrap() {
            Some(OtaStatus::UpdateAvailable(update)) => {
                assert_eq!(update.version, "2.1.0");
                assert_eq!(update.size, 524_288);
            }
            other => panic!("Unexpected result {:?}", other),
        }

        let sent = requests(&client);
        assert!(sent[1].contains("GET /api/iot/v1/ota/check?version=2.0.0"));
    }

    #[test]
    fn test_ota_report_includes_error_only_when_present() {
        let mut dialer = MockDialer::new();
        dialer.queue(handshake_ok());
        dialer.queue(status_only(200, "OK"));
        dialer.queue(status_only(200, "OK"));

        let mut client = client(dialer);
        let clock = TestClock::new();

        client.authenticate(&clock).unwrap();
        client.ota_report(&clock, "applied", None).unwrap();
        client
            .ota_report(&clock, "failed", Some("hash mismatch"))
            .unwrap();

        let sent = requests(&client);
        assert!(!sent[1].contains("error"));
        assert!(sent[2].contains(r#""error":"hash mismatch""#));
    }

    #[test]
    fn test_fetch_config_returns_opaque_blob() {
        let mut dialer = MockDialer::new();
        dialer.queue(handshake_ok());
        dialer.queue(ok_json(r#"{"bus_baud":19200}"#));

        let mut client = client(dialer);
        let clock = TestClock::new();

        client.authenticate(&clock).unwrap();
        let blob = client.fetch_config(&clock).unwrap().unwrap();

        assert_eq!(blob, br#"{"bus_baud":19200}"#);
        assert_eq!(client.stats().config_fetches, 1);
    }

    fn extract_header(request: &str, name: &str) -> String {
        request
            .lines()
            .find(|line| line.to_ascii_lowercase().starts_with(name))
            .unwrap_or_else(|| panic!("header {} missing in {}", name, request))
            .to_string()
    }
}
