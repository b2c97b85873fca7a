use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};

use serde::{Serialize, Serializer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info};

use crate::config::{HttpSinkConfig, ServerConfig};

/// Capacity of the HTTP delivery queue. On overflow the oldest queued
/// event is dropped to make room.
const EVENT_QUEUE_CAP: usize = 256;

/// Hard cap on each HTTP sink operation: connect, send, and every read.
const HTTP_IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Transfer lifecycle stage. Serialized as its integer value under the
/// JSON key `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start = 0,
    Done = 1,
    Error = 2,
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// One transfer lifecycle record. Fully populated before emission and
/// immutable afterwards; a START record carries an empty `end` timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub client_ip: String,
    pub client_port: u16,
    pub filename: String,
    pub bytes: u64,
    pub status: String,
    pub message: String,
    pub start: String,
    pub end: String,
}

/// Current local time as ISO-8601 with seconds precision, no timezone
/// suffix.
pub fn now_iso8601() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Bounded FIFO feeding the HTTP delivery worker.
struct EventQueue {
    events: VecDeque<Event>,
    stop: bool,
}

impl EventQueue {
    fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(EVENT_QUEUE_CAP),
            stop: false,
        }
    }

    fn push(&mut self, ev: Event) {
        if self.events.len() == EVENT_QUEUE_CAP {
            self.events.pop_front();
        }
        self.events.push_back(ev);
    }

    fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }
}

struct UdpSink {
    socket: std::net::UdpSocket,
    dest: SocketAddrV4,
}

struct HttpShared {
    target: HttpSinkConfig,
    queue: Mutex<EventQueue>,
    notify: Notify,
}

struct HttpSink {
    shared: Arc<HttpShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct PipelineInner {
    udp: Option<UdpSink>,
    http: Option<HttpSink>,
}

/// Fan-out handle for transfer events. Cloned into every listener and
/// session; `emit` never blocks on sink delivery beyond a single UDP
/// `send_to`.
#[derive(Clone)]
pub struct EventPipeline {
    inner: Arc<PipelineInner>,
}

impl EventPipeline {
    /// Build the pipeline from the configured sinks. The HTTP delivery
    /// worker is spawned here, so a tokio runtime must be running.
    pub fn new(cfg: &ServerConfig) -> Self {
        let udp = cfg.event_udp.and_then(|dest| {
            match std::net::UdpSocket::bind("0.0.0.0:0") {
                Ok(socket) => Some(UdpSink { socket, dest }),
                Err(e) => {
                    error!("failed to create UDP event socket: {e}");
                    None
                }
            }
        });

        let http = cfg.event_http.clone().map(|target| {
            let shared = Arc::new(HttpShared {
                target,
                queue: Mutex::new(EventQueue::new()),
                notify: Notify::new(),
            });
            let worker = tokio::spawn(http_worker(Arc::clone(&shared)));
            HttpSink {
                shared,
                worker: Mutex::new(Some(worker)),
            }
        });

        Self {
            inner: Arc::new(PipelineInner { udp, http }),
        }
    }

    /// Deliver one event to every configured sink. The local log and the
    /// UDP sink run inline on the caller; the HTTP sink only enqueues.
    pub fn emit(&self, ev: &Event) {
        info!(
            kind = ?ev.kind,
            client_ip = %ev.client_ip,
            client_port = ev.client_port,
            filename = %ev.filename,
            bytes = ev.bytes,
            status = %ev.status,
            message = %ev.message,
            "transfer event"
        );

        if let Some(udp) = &self.inner.udp
            && let Ok(json) = serde_json::to_vec(ev)
        {
            // Fire and forget.
            let _ = udp.socket.send_to(&json, udp.dest);
        }

        if let Some(http) = &self.inner.http {
            http.shared.queue.lock().unwrap().push(ev.clone());
            http.shared.notify.notify_one();
        }
    }

    /// Stop the HTTP delivery worker without draining the queue and wait
    /// for it to exit. The UDP and HTTP sockets close on drop.
    pub async fn shutdown(&self) {
        let Some(http) = &self.inner.http else {
            return;
        };
        http.shared.queue.lock().unwrap().stop = true;
        http.shared.notify.notify_one();

        let worker = http.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

/// Single consumer of the event queue. Delivers one POST per event over a
/// fresh connection; exits as soon as it observes the stop flag, leaving
/// anything still queued behind.
async fn http_worker(shared: Arc<HttpShared>) {
    loop {
        let next = {
            let mut q = shared.queue.lock().unwrap();
            if q.stop {
                return;
            }
            q.pop()
        };
        match next {
            Some(ev) => deliver_http(&shared.target, &ev).await,
            None => shared.notify.notified().await,
        }
    }
}

async fn deliver_http(target: &HttpSinkConfig, ev: &Event) {
    let Ok(body) = serde_json::to_string(ev) else {
        return;
    };
    let request = format!(
        "POST {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        target.path,
        target.host,
        body.len(),
        body
    );

    let connect = TcpStream::connect((target.host.as_str(), target.port));
    let mut stream = match timeout(HTTP_IO_TIMEOUT, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("HTTP event sink connect failed: {e}");
            return;
        }
        Err(_) => {
            debug!("HTTP event sink connect timed out");
            return;
        }
    };

    match timeout(HTTP_IO_TIMEOUT, stream.write_all(request.as_bytes())).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!("HTTP event sink send failed: {e}");
            return;
        }
        Err(_) => {
            debug!("HTTP event sink send timed out");
            return;
        }
    }

    // Read and discard the response until the peer closes or stalls.
    let mut buf = [0u8; 256];
    loop {
        match timeout(HTTP_IO_TIMEOUT, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: u64) -> Event {
        Event {
            kind: EventKind::Done,
            client_ip: "10.0.0.1".into(),
            client_port: 4096,
            filename: format!("file-{n}"),
            bytes: n,
            status: "ok".into(),
            message: "transfer_complete".into(),
            start: "2026-08-01T10:00:00".into(),
            end: "2026-08-01T10:00:01".into(),
        }
    }

    #[test]
    fn queue_drops_oldest_on_overflow() {
        let mut q = EventQueue::new();
        for n in 0..(EVENT_QUEUE_CAP as u64 + 44) {
            q.push(event(n));
        }
        assert_eq!(q.events.len(), EVENT_QUEUE_CAP);
        // The first 44 were overwritten; the rest survive in FIFO order.
        assert_eq!(q.pop().unwrap().bytes, 44);
        let mut last = 44;
        while let Some(ev) = q.pop() {
            last = ev.bytes;
        }
        assert_eq!(last, EVENT_QUEUE_CAP as u64 + 43);
    }

    #[test]
    fn queue_is_fifo_below_capacity() {
        let mut q = EventQueue::new();
        for n in 0..10 {
            q.push(event(n));
        }
        for n in 0..10 {
            assert_eq!(q.pop().unwrap().bytes, n);
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn event_json_shape() {
        let ev = Event {
            kind: EventKind::Start,
            client_ip: "192.168.1.50".into(),
            client_port: 51234,
            filename: "boot/pxelinux.0".into(),
            bytes: 0,
            status: "start".into(),
            message: "rrq_received".into(),
            start: "2026-08-01T09:30:00".into(),
            end: String::new(),
        };
        assert_eq!(
            serde_json::to_string(&ev).unwrap(),
            "{\"type\":0,\"client_ip\":\"192.168.1.50\",\"client_port\":51234,\
             \"filename\":\"boot/pxelinux.0\",\"bytes\":0,\"status\":\"start\",\
             \"message\":\"rrq_received\",\"start\":\"2026-08-01T09:30:00\",\"end\":\"\"}"
        );
    }

    #[test]
    fn event_kinds_serialize_as_integers() {
        for (kind, n) in [
            (EventKind::Start, 0),
            (EventKind::Done, 1),
            (EventKind::Error, 2),
        ] {
            let mut ev = event(0);
            ev.kind = kind;
            let v: serde_json::Value = serde_json::from_str(&serde_json::to_string(&ev).unwrap()).unwrap();
            assert_eq!(v["type"], n);
        }
    }

    #[test]
    fn hostile_filenames_stay_valid_json() {
        let mut ev = event(0);
        ev.filename = "we\"ird\\name\n.bin".into();
        let json = serde_json::to_string(&ev).unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["filename"], "we\"ird\\name\n.bin");
    }

    #[test]
    fn timestamp_format() {
        let ts = now_iso8601();
        // e.g. 2026-08-01T09:30:00 — 19 chars, no timezone suffix.
        assert_eq!(ts.len(), 19);
        assert_eq!(ts.as_bytes()[10], b'T');
        assert!(!ts.ends_with('Z'));
    }
}
