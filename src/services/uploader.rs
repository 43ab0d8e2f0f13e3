//! Upload client.
//!
//! Drains the spool strictly in sequence order. The client is an explicit
//! state machine:
//!
//! ```text
//!          enqueue / poll                 2xx or permanent
//!   Idle ─────────────────▶ Attempting ◀──────────────────┐
//!    ▲                        │    │                      │
//!    └──── queue empty ───────┘    │ transient            │
//!                                  ▼                      │
//!                              Backoff ── delay at max ─▶ Offline
//! ```
//!
//! A transient failure retries the same head entry after a growing delay. A
//! permanent rejection parks the entry and moves on, which is the only way
//! an entry is ever skipped.

use super::Backoff;
use crate::config::UploadConfig;
use crate::models::QueueEntry;
use crate::shutdown::Shutdown;
use crate::storage::SpoolQueue;
use crate::transport::{DeliveryOutcome, PhotoTransport};
use crate::Result;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upload client state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Nothing to send.
    Idle,
    /// A request for the head entry is in flight or about to be.
    Attempting,
    /// Waiting before retrying the head entry.
    Backoff,
    /// Backoff reached its ceiling; retrying quietly at the ceiling.
    Offline,
}

impl UploadState {
    /// Returns the display name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Attempting => "attempting",
            Self::Backoff => "backoff",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one [`UploadClient::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The queue was empty; the client waited for new frames.
    Idle,
    /// The head entry was acknowledged.
    Delivered {
        /// Sequence number of the entry.
        seq: i64,
    },
    /// The head entry failed transiently and the client waited `delay`.
    Retried {
        /// Sequence number of the entry.
        seq: i64,
        /// Backoff delay applied.
        delay: Duration,
    },
    /// The head entry was rejected and parked.
    Rejected {
        /// Sequence number of the entry.
        seq: i64,
    },
    /// Shutdown was requested.
    Stopped,
}

/// Drains the spool to a transport.
pub struct UploadClient<T: PhotoTransport> {
    queue: Arc<SpoolQueue>,
    transport: T,
    backoff: Backoff,
    idle_poll: Duration,
    state: UploadState,
    offline_since: Option<Instant>,
}

impl<T: PhotoTransport> UploadClient<T> {
    /// Creates a client.
    pub fn new(queue: Arc<SpoolQueue>, transport: T, config: &UploadConfig) -> Self {
        Self {
            queue,
            transport,
            backoff: Backoff::from_config(config),
            idle_poll: config.idle_poll,
            state: UploadState::Idle,
            offline_since: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> UploadState {
        self.state
    }

    /// Runs until `shutdown` fires.
    ///
    /// Queue errors are logged and retried after the idle poll interval.
    pub fn drain(&mut self, shutdown: &Shutdown) {
        tracing::info!("Upload loop started");
        loop {
            match self.step(shutdown) {
                Ok(Step::Stopped) => break,
                Ok(_) => {},
                Err(e) => {
                    tracing::error!(error = %e, "Spool access failed");
                    if shutdown.wait_timeout(self.idle_poll) {
                        break;
                    }
                },
            }
        }
        tracing::info!("Upload loop stopped");
    }

    /// Advances the state machine by one transition.
    ///
    /// # Errors
    ///
    /// Returns an error if the spool cannot be read or updated.
    pub fn step(&mut self, shutdown: &Shutdown) -> Result<Step> {
        if shutdown.is_triggered() {
            return Ok(Step::Stopped);
        }

        let Some(entry) = self.queue.next_pending()? else {
            self.state = UploadState::Idle;
            self.queue.wait_for_arrival(self.idle_poll);
            return Ok(Step::Idle);
        };

        if shutdown.is_triggered() {
            self.queue.release(&entry)?;
            return Ok(Step::Stopped);
        }

        if self.state != UploadState::Offline {
            self.state = UploadState::Attempting;
        }
        let outcome = self.transport.send(entry.photo());
        metrics::counter!("lapse_uploads_total", "status" => outcome.label()).increment(1);

        let recorded = match outcome {
            DeliveryOutcome::Delivered { status } => self.on_delivered(&entry, status),
            DeliveryOutcome::Permanent { status, reason } => {
                self.on_rejected(&entry, status, &reason)
            },
            DeliveryOutcome::Transient(reason) => self.on_transient(&entry, &reason, shutdown),
        };

        if recorded.is_err() {
            // Do not leave the entry stuck in `delivering` until the next restart.
            let _ = self.queue.release(&entry);
        }
        recorded
    }

    fn on_delivered(&mut self, entry: &QueueEntry, status: u16) -> Result<Step> {
        self.queue.mark_delivered(entry)?;
        self.reconnected();
        tracing::info!(
            filename = %entry.photo().filename(),
            seq = entry.seq(),
            status,
            "Uploaded frame"
        );
        Ok(Step::Delivered { seq: entry.seq() })
    }

    fn on_rejected(&mut self, entry: &QueueEntry, status: u16, reason: &str) -> Result<Step> {
        self.queue.mark_failed(entry, true, reason)?;
        self.reconnected();
        tracing::error!(
            filename = %entry.photo().filename(),
            seq = entry.seq(),
            status,
            reason = %reason,
            "Receiver rejected frame, leaving it in the spool"
        );
        Ok(Step::Rejected { seq: entry.seq() })
    }

    fn on_transient(
        &mut self,
        entry: &QueueEntry,
        reason: &str,
        shutdown: &Shutdown,
    ) -> Result<Step> {
        self.queue.mark_failed(entry, false, reason)?;
        let delay = self.backoff.next_delay();

        if self.backoff.at_ceiling() {
            if self.offline_since.is_none() {
                self.offline_since = Some(Instant::now());
                tracing::warn!(
                    filename = %entry.photo().filename(),
                    delay_ms = delay.as_millis(),
                    reason = %reason,
                    "Receiver unreachable, going offline"
                );
            } else {
                tracing::debug!(
                    filename = %entry.photo().filename(),
                    delay_ms = delay.as_millis(),
                    reason = %reason,
                    "Still offline"
                );
            }
            self.state = UploadState::Offline;
        } else {
            tracing::warn!(
                filename = %entry.photo().filename(),
                attempt = self.backoff.failures(),
                delay_ms = delay.as_millis(),
                reason = %reason,
                "Upload failed, backing off"
            );
            self.state = UploadState::Backoff;
        }

        if shutdown.wait_timeout(delay) {
            return Ok(Step::Stopped);
        }
        Ok(Step::Retried {
            seq: entry.seq(),
            delay,
        })
    }

    fn reconnected(&mut self) {
        if let Some(since) = self.offline_since.take() {
            tracing::info!(
                offline_secs = since.elapsed().as_secs(),
                "Receiver reachable again"
            );
        }
        self.backoff.reset();
        self.state = UploadState::Attempting;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeliveryState, ExposureMode, Photo};
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Transport replaying scripted outcomes, then succeeding.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<DeliveryOutcome>>,
        sent: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<DeliveryOutcome>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl PhotoTransport for ScriptedTransport {
        fn send(&self, photo: &Photo) -> DeliveryOutcome {
            self.sent.lock().unwrap().push(photo.filename().to_string());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(DeliveryOutcome::Delivered { status: 200 })
        }
    }

    fn upload_config() -> UploadConfig {
        UploadConfig {
            initial_backoff: Duration::from_millis(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_millis(4),
            idle_poll: Duration::from_millis(5),
            ..UploadConfig::default()
        }
    }

    fn spool_with(count: u32) -> Arc<SpoolQueue> {
        let queue = Arc::new(SpoolQueue::in_memory().unwrap());
        for n in 1..=count {
            let at = Utc.with_ymd_and_hms(2026, 3, 14, 18, 0, n).unwrap();
            queue
                .enqueue(Photo::new(
                    at,
                    ExposureMode::Auto,
                    None,
                    true,
                    format!("pic_01_2026-03-14_18-00-{n:02}.jpg"),
                    vec![0xFF, 0xD8, 0xFF],
                ))
                .unwrap();
        }
        queue
    }

    fn transient() -> DeliveryOutcome {
        DeliveryOutcome::Transient("connection refused".to_string())
    }

    #[test]
    fn test_transient_failures_back_off_then_deliver_in_order() {
        let queue = spool_with(3);
        let transport = Arc::new(ScriptedTransport::new(vec![
            transient(),
            transient(),
            transient(),
            transient(),
        ]));
        let mut client = UploadClient::new(Arc::clone(&queue), Arc::clone(&transport), &upload_config());
        let shutdown = Shutdown::new();

        let mut delays = Vec::new();
        let mut delivered = Vec::new();
        while delivered.len() < 3 {
            match client.step(&shutdown).unwrap() {
                Step::Retried { seq, delay } => {
                    assert_eq!(seq, 1, "retries must target the head entry");
                    delays.push(delay);
                },
                Step::Delivered { seq } => delivered.push(seq),
                other => panic!("unexpected step {other:?}"),
            }
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1),
                Duration::from_millis(2),
                Duration::from_millis(4),
                Duration::from_millis(4),
            ]
        );
        assert_eq!(delivered, vec![1, 2, 3]);
        assert_eq!(
            transport.sent(),
            vec![
                "pic_01_2026-03-14_18-00-01.jpg",
                "pic_01_2026-03-14_18-00-01.jpg",
                "pic_01_2026-03-14_18-00-01.jpg",
                "pic_01_2026-03-14_18-00-01.jpg",
                "pic_01_2026-03-14_18-00-01.jpg",
                "pic_01_2026-03-14_18-00-02.jpg",
                "pic_01_2026-03-14_18-00-03.jpg",
            ]
        );
        assert_eq!(queue.stats().unwrap().delivered, 3);
    }

    #[test]
    fn test_offline_entered_at_ceiling_and_left_on_success() {
        let queue = spool_with(1);
        let transport = ScriptedTransport::new(vec![transient(), transient(), transient()]);
        let mut client = UploadClient::new(queue, transport, &upload_config());
        let shutdown = Shutdown::new();

        client.step(&shutdown).unwrap();
        assert_eq!(client.state(), UploadState::Backoff);
        client.step(&shutdown).unwrap();
        assert_eq!(client.state(), UploadState::Backoff);
        client.step(&shutdown).unwrap();
        assert_eq!(client.state(), UploadState::Offline);

        assert_eq!(client.step(&shutdown).unwrap(), Step::Delivered { seq: 1 });
        assert_eq!(client.state(), UploadState::Attempting);
        assert_eq!(client.step(&shutdown).unwrap(), Step::Idle);
        assert_eq!(client.state(), UploadState::Idle);
    }

    #[test]
    fn test_permanent_rejection_skips_only_that_entry() {
        let queue = spool_with(10);
        let mut script: Vec<_> = (0..4)
            .map(|_| DeliveryOutcome::Delivered { status: 200 })
            .collect();
        script.push(DeliveryOutcome::Permanent {
            status: 400,
            reason: "HTTP 400: Invalid filename".to_string(),
        });
        let transport = Arc::new(ScriptedTransport::new(script));
        let mut client = UploadClient::new(Arc::clone(&queue), Arc::clone(&transport), &upload_config());
        let shutdown = Shutdown::new();

        let mut steps = Vec::new();
        loop {
            match client.step(&shutdown).unwrap() {
                Step::Idle => break,
                step => steps.push(step),
            }
        }

        assert_eq!(steps.len(), 10);
        assert_eq!(steps[4], Step::Rejected { seq: 5 });
        let delivered: Vec<_> = steps
            .iter()
            .filter_map(|s| match s {
                Step::Delivered { seq } => Some(*seq),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![1, 2, 3, 4, 6, 7, 8, 9, 10]);

        let rejected = queue.get(5).unwrap().unwrap();
        assert_eq!(rejected.state(), DeliveryState::FailedPermanent);
        assert_eq!(rejected.last_error(), Some("HTTP 400: Invalid filename"));
        assert!(!rejected.photo().data().is_empty());
    }

    #[test]
    fn test_shutdown_interrupts_backoff_and_keeps_entry() {
        let queue = spool_with(1);
        let config = UploadConfig {
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            ..upload_config()
        };
        let transport = ScriptedTransport::new(vec![transient()]);
        let mut client = UploadClient::new(Arc::clone(&queue), transport, &config);
        let shutdown = Shutdown::new();

        let remote = shutdown.clone();
        let trigger = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.trigger();
        });

        let start = Instant::now();
        assert_eq!(client.step(&shutdown).unwrap(), Step::Stopped);
        assert!(start.elapsed() < Duration::from_secs(30));
        trigger.join().unwrap();

        let entry = queue.get(1).unwrap().unwrap();
        assert_eq!(entry.state(), DeliveryState::Pending);
        assert_eq!(client.step(&shutdown).unwrap(), Step::Stopped);
    }

    #[test]
    fn test_drain_stops_on_shutdown() {
        let queue = spool_with(2);
        let shutdown = Shutdown::new();
        let handle = {
            let queue = Arc::clone(&queue);
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                let mut client =
                    UploadClient::new(queue, ScriptedTransport::default(), &upload_config());
                client.drain(&shutdown);
            })
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        while queue.stats().unwrap().delivered < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        shutdown.trigger();
        handle.join().unwrap();
        assert_eq!(queue.stats().unwrap().delivered, 2);
    }
}
