//! Single-master arbitration for the inverter leg.
//!
//! All upstream sessions funnel their requests through [`Transactor::transact`],
//! which owns the downstream port behind a mutex, enforces the minimum
//! inter-transaction period, and turns every exchange into a REQ + RSP/ERR
//! event pair on the wire stream.

use crate::error::Fault;
use crate::event::{EventHub, Origin, WireEvent};
use crate::frame;
use crate::transport::DownstreamLink;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One upstream request on its way to the inverter. The frame always carries
/// a CRC trailer; Shine forwards the dongle's own, TCP sessions append one.
#[derive(Debug, Clone)]
pub struct Request {
    pub origin: Origin,
    pub frame: Vec<u8>,
}

impl Request {
    /// Forward a frame exactly as received (CRC included).
    #[must_use]
    pub fn raw(origin: Origin, frame: Vec<u8>) -> Self {
        Request { origin, frame }
    }

    /// Build an RTU frame from a unit id and PDU, appending a fresh CRC.
    #[must_use]
    pub fn from_pdu(origin: Origin, unit_id: u8, pdu: &[u8]) -> Self {
        let mut body = Vec::with_capacity(1 + pdu.len());
        body.push(unit_id);
        body.extend_from_slice(pdu);
        Request {
            origin,
            frame: frame::append_crc(&body),
        }
    }
}

pub type TransactResult = std::result::Result<Vec<u8>, Fault>;

struct Inner<L> {
    link: L,
    /// `None` until the first transaction completes, so startup is not paced.
    last_done: Option<Instant>,
    open_seen: bool,
}

/// Owns the inverter port and executes one exchange at a time.
///
/// Callers queue on the internal mutex; tokio wakes waiters in FIFO order,
/// which provides the global arrival-order guarantee.
pub struct Transactor<L> {
    inner: Mutex<Inner<L>>,
    min_period: Duration,
    read_timeout: Duration,
    events: EventHub,
    cancel: CancellationToken,
}

impl<L: DownstreamLink> Transactor<L> {
    pub fn new(
        link: L,
        min_period: Duration,
        read_timeout: Duration,
        events: EventHub,
        cancel: CancellationToken,
    ) -> Self {
        Transactor {
            inner: Mutex::new(Inner {
                link,
                last_done: None,
                open_seen: true,
            }),
            min_period,
            read_timeout,
            events,
            cancel,
        }
    }

    /// Execute one request/response exchange on the downstream wire.
    ///
    /// Blocks (cooperatively) until the response arrives, the read timeout
    /// elapses, the port turns out to be closed, or the broker shuts down.
    /// Once the frame has been written the exchange always runs to its
    /// natural end; shutdown is only observed before that point.
    pub async fn transact(&self, req: Request) -> TransactResult {
        let mut inner = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Fault::Shutdown),
            guard = self.inner.lock() => guard,
        };

        // A closed port fails pending requests without waiting out the
        // pacing interval; the reopen loop owns recovery.
        if !inner.link.is_open() {
            self.events.emit(&WireEvent::request(&req.origin, &req.frame));
            self.events
                .emit(&WireEvent::fault(&req.origin, Fault::PortClosed, None));
            return Err(Fault::PortClosed);
        }

        if let Some(last) = inner.last_done {
            let due = last + self.min_period;
            if due > Instant::now() {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return Err(Fault::Shutdown),
                    () = tokio::time::sleep_until(due) => {}
                }
            }
        }

        inner.link.drain().await;
        self.events.emit(&WireEvent::request(&req.origin, &req.frame));

        if !frame::crc_ok(&req.frame) {
            self.events
                .emit(&WireEvent::fault(&req.origin, Fault::CrcMismatch, None));
            return Err(Fault::CrcMismatch);
        }

        if let Err(fault) = inner.link.write_frame(&req.frame).await {
            inner.last_done = Some(Instant::now());
            self.events.emit(&WireEvent::fault(&req.origin, fault, None));
            return Err(fault);
        }

        let read = inner.link.read_frame(self.read_timeout).await;
        inner.last_done = Some(Instant::now());

        let outcome = match read {
            Err(fault) => Err((fault, Vec::new())),
            Ok(bytes) if bytes.is_empty() => Err((Fault::Timeout, bytes)),
            Ok(bytes) if bytes.len() < frame::MIN_FRAME_LEN => Err((Fault::ShortFrame, bytes)),
            Ok(bytes) if !frame::crc_ok(&bytes) => Err((Fault::CrcMismatch, bytes)),
            Ok(bytes) => Ok(bytes),
        };

        match outcome {
            Ok(bytes) => {
                self.events
                    .emit(&WireEvent::response(&req.origin, &bytes, &req.frame));
                Ok(bytes)
            }
            Err((fault, partial)) => {
                self.events
                    .emit(&WireEvent::fault(&req.origin, fault, Some(&partial)));
                Err(fault)
            }
        }
    }

    /// Supervisor task restoring the inverter port after it disappears.
    ///
    /// Polls the open/closed flag, announces transitions on the event stream,
    /// and retries the reopen with exponential backoff capped at 5 s.
    pub async fn reopen_loop(&self) {
        let mut backoff = Duration::from_millis(500);
        loop {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(250)) => {}
                () = self.cancel.cancelled() => return,
            }
            let mut inner = tokio::select! {
                guard = self.inner.lock() => guard,
                () = self.cancel.cancelled() => return,
            };
            if inner.link.is_open() {
                inner.open_seen = true;
                backoff = Duration::from_millis(500);
                continue;
            }
            if inner.open_seen {
                inner.open_seen = false;
                self.events
                    .emit(&WireEvent::info("inverter_lost").on_port(inner.link.device()));
                tracing::warn!("Inverter port {} lost, reopening", inner.link.device());
            }
            match inner.link.reopen().await {
                Ok(()) => {
                    inner.open_seen = true;
                    self.events
                        .emit(&WireEvent::info("inverter_reopened").on_port(inner.link.device()));
                    tracing::info!("Inverter port {} reopened", inner.link.device());
                    backoff = Duration::from_millis(500);
                }
                Err(e) => {
                    tracing::debug!(
                        "Reopen of {} failed: {}. Retrying in {:?}",
                        inner.link.device(),
                        e,
                        backoff
                    );
                    drop(inner);
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        () = self.cancel.cancelled() => return,
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BrokerError, Result};
    use crate::event::EventSink;
    use crate::frame::append_crc;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex as StdMutex};

    /// What the fake downstream does when the next request arrives.
    #[derive(Clone)]
    enum Script {
        Reply(Vec<u8>),
        Silent,
        FailWrite,
    }

    #[derive(Default)]
    struct LinkState {
        script: VecDeque<Script>,
        stale: Vec<u8>,
        writes: Vec<(Instant, Vec<u8>)>,
        drained: usize,
        open: bool,
    }

    #[derive(Clone)]
    struct FakeLink(Arc<StdMutex<LinkState>>);

    impl FakeLink {
        fn new(script: Vec<Script>) -> Self {
            FakeLink(Arc::new(StdMutex::new(LinkState {
                script: script.into(),
                open: true,
                ..LinkState::default()
            })))
        }
    }

    impl DownstreamLink for FakeLink {
        fn device(&self) -> &str {
            "fake"
        }

        fn is_open(&self) -> bool {
            self.0.lock().unwrap().open
        }

        async fn drain(&mut self) {
            let mut state = self.0.lock().unwrap();
            state.stale.clear();
            state.drained += 1;
        }

        async fn write_frame(&mut self, bytes: &[u8]) -> std::result::Result<(), Fault> {
            let mut state = self.0.lock().unwrap();
            if matches!(state.script.front(), Some(Script::FailWrite)) {
                state.script.pop_front();
                state.open = false;
                return Err(Fault::WriteFailed);
            }
            state.writes.push((Instant::now(), bytes.to_vec()));
            Ok(())
        }

        async fn read_frame(&mut self, timeout: Duration) -> std::result::Result<Vec<u8>, Fault> {
            let next = self.0.lock().unwrap().script.pop_front();
            match next {
                Some(Script::Reply(bytes)) => Ok(bytes),
                Some(Script::Silent) | None => {
                    tokio::time::sleep(timeout).await;
                    Ok(Vec::new())
                }
                Some(Script::FailWrite) => unreachable!("consumed by write"),
            }
        }

        async fn reopen(&mut self) -> Result<()> {
            let mut state = self.0.lock().unwrap();
            if state.open {
                return Ok(());
            }
            Err(BrokerError::Config("still unplugged".to_string()))
        }
    }

    struct Capture(StdMutex<Vec<serde_json::Value>>);

    impl EventSink for Capture {
        fn handle(&self, line: &str) {
            self.0
                .lock()
                .unwrap()
                .push(serde_json::from_str(line).unwrap());
        }
    }

    struct CaptureRef(Arc<Capture>);

    impl EventSink for CaptureRef {
        fn handle(&self, line: &str) {
            self.0.handle(line);
        }
    }

    fn harness(script: Vec<Script>) -> (Transactor<FakeLink>, FakeLink, Arc<Capture>) {
        let link = FakeLink::new(script);
        let capture = Arc::new(Capture(StdMutex::new(Vec::new())));
        let events = EventHub::new(vec![Box::new(CaptureRef(capture.clone()))]);
        let transactor = Transactor::new(
            link.clone(),
            Duration::from_secs(1),
            Duration::from_millis(1500),
            events,
            CancellationToken::new(),
        );
        (transactor, link, capture)
    }

    fn read_request() -> Request {
        Request::from_pdu(Origin::Shine, 1, &[0x03, 0x00, 0x00, 0x00, 0x02])
    }

    #[tokio::test(start_paused = true)]
    async fn paces_consecutive_transactions() {
        let reply = append_crc(&[0x01, 0x03, 0x04, 0x00, 0x64, 0x00, 0x00]);
        let (transactor, link, _) = harness(vec![
            Script::Reply(reply.clone()),
            Script::Reply(reply),
        ]);

        let start = Instant::now();
        transactor.transact(read_request()).await.unwrap();
        transactor.transact(read_request()).await.unwrap();

        let state = link.0.lock().unwrap();
        let writes = &state.writes;
        assert_eq!(writes.len(), 2);
        // First write runs immediately, second one only after min-period.
        assert_eq!(writes[0].0, start);
        assert!(writes[1].0 - writes[0].0 >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn drains_stale_bytes_before_writing() {
        let reply = append_crc(&[0x01, 0x03, 0x02, 0x00, 0x01]);
        let (transactor, link, _) = harness(vec![Script::Reply(reply)]);
        link.0.lock().unwrap().stale = vec![0xAA, 0xBB];

        transactor.transact(read_request()).await.unwrap();

        let state = link.0.lock().unwrap();
        assert!(state.stale.is_empty());
        assert_eq!(state.drained, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_downstream_is_a_timeout() {
        let (transactor, _, capture) = harness(vec![Script::Silent]);

        let err = transactor.transact(read_request()).await.unwrap_err();
        assert_eq!(err, Fault::Timeout);

        let events = capture.0.lock().unwrap();
        assert_eq!(events[0]["role"], "REQ");
        assert_eq!(events[1]["role"], "ERR");
        assert_eq!(events[1]["reason"], "timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn corrupted_response_is_a_crc_mismatch() {
        // Valid-looking response body with a wrong trailer.
        let bad = vec![0x01, 0x03, 0x04, 0x00, 0x64, 0x00, 0x00, 0x00, 0x00];
        let (transactor, _, capture) = harness(vec![Script::Reply(bad)]);

        let err = transactor.transact(read_request()).await.unwrap_err();
        assert_eq!(err, Fault::CrcMismatch);

        let events = capture.0.lock().unwrap();
        assert_eq!(events[1]["reason"], "crc_mismatch");
        assert_eq!(events[1]["crc_ok"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn truncated_response_is_a_short_frame() {
        let (transactor, _, _) = harness(vec![Script::Reply(vec![0x01, 0x83])]);
        let err = transactor.transact(read_request()).await.unwrap_err();
        assert_eq!(err, Fault::ShortFrame);
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_closes_port_and_later_requests_fail_fast() {
        let (transactor, link, capture) = harness(vec![Script::FailWrite]);

        let start = Instant::now();
        let err = transactor.transact(read_request()).await.unwrap_err();
        assert_eq!(err, Fault::WriteFailed);

        // Port is closed now; the next request fails without waiting out
        // the pacing interval and without touching the wire.
        let err = transactor.transact(read_request()).await.unwrap_err();
        assert_eq!(err, Fault::PortClosed);
        assert_eq!(Instant::now(), start);
        assert!(link.0.lock().unwrap().writes.is_empty());

        let events = capture.0.lock().unwrap();
        let reasons: Vec<_> = events
            .iter()
            .filter(|e| e["role"] == "ERR")
            .map(|e| e["reason"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(reasons, ["write_failed", "port_closed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_request_with_wrong_crc() {
        let (transactor, link, capture) = harness(vec![]);
        let mut frame = append_crc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        let last = frame.len() - 1;
        frame[last] ^= 0x5A;

        let err = transactor
            .transact(Request::raw(Origin::Shine, frame))
            .await
            .unwrap_err();
        assert_eq!(err, Fault::CrcMismatch);
        assert!(link.0.lock().unwrap().writes.is_empty());

        let events = capture.0.lock().unwrap();
        assert_eq!(events[0]["role"], "REQ");
        assert_eq!(events[0]["crc_ok"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_waiters_before_the_wire() {
        let (transactor, _, _) = harness(vec![]);
        transactor.cancel.cancel();
        let err = transactor.transact(read_request()).await.unwrap_err();
        assert_eq!(err, Fault::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn responses_resolve_in_submission_order() {
        let r1 = append_crc(&[0x01, 0x03, 0x02, 0x00, 0x01]);
        let r2 = append_crc(&[0x01, 0x03, 0x02, 0x00, 0x02]);
        let (transactor, _, _) = harness(vec![Script::Reply(r1.clone()), Script::Reply(r2.clone())]);
        let transactor = Arc::new(transactor);

        let t1 = {
            let t = transactor.clone();
            tokio::spawn(async move { t.transact(read_request()).await })
        };
        tokio::task::yield_now().await;
        let t2 = {
            let t = transactor.clone();
            tokio::spawn(async move { t.transact(read_request()).await })
        };

        assert_eq!(t1.await.unwrap().unwrap(), r1);
        assert_eq!(t2.await.unwrap().unwrap(), r2);
    }
}
