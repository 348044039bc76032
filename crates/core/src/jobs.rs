//! Hand-off of finished upload responses to clients that were redirected
//! to poll for them.
//!
//! A job is created when an intercepted upload moves to the background. The
//! background task calls [`JobTicket::deliver`] with the final upstream
//! response; a client polling through [`JobRegistry::wait`] receives it. At
//! most one response is ever delivered per job and the job is retired
//! exactly once, when its ticket is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WAIT_SAFETY_TIMEOUT: Duration = Duration::from_secs(55);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationTimeouts {
    /// How long a finished job waits for a consumer to show up.
    pub delivery: Duration,
    /// How long the producer waits for the consumer to finish writing.
    pub ack: Duration,
    /// How long one poll blocks before telling the client to poll again.
    pub wait_safety: Duration,
}

impl Default for ContinuationTimeouts {
    fn default() -> Self {
        Self {
            delivery: DEFAULT_DELIVERY_TIMEOUT,
            ack: DEFAULT_ACK_TIMEOUT,
            wait_safety: DEFAULT_WAIT_SAFETY_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    AckTimedOut,
    /// Nobody collected the response in time, or it was dropped unsent.
    Abandoned,
}

pub enum WaitOutcome {
    NotFound,
    Ready(Response),
    StillRunning,
    /// The job ended without delivering anything.
    Closed,
}

struct Delivery {
    response: Response,
    ack: oneshot::Sender<()>,
}

impl Delivery {
    fn into_response(self) -> Response {
        let guard = AckGuard(Some(self.ack));
        let (parts, body) = self.response.into_parts();
        let stream = body.into_data_stream().map(move |chunk| {
            let _held = &guard;
            chunk
        });
        Response::from_parts(parts, Body::from_stream(stream))
    }
}

/// Acknowledges the delivery once the response body is released.
struct AckGuard(Option<oneshot::Sender<()>>);

impl Drop for AckGuard {
    fn drop(&mut self) {
        if let Some(ack) = self.0.take() {
            let _ = ack.send(());
        }
    }
}

struct JobRecord {
    id: String,
    created_at: DateTime<Utc>,
    waiter: Mutex<Option<oneshot::Sender<Delivery>>>,
    waiter_arrived: Notify,
}

impl JobRecord {
    fn waiter(&self) -> MutexGuard<'_, Option<oneshot::Sender<Delivery>>> {
        self.waiter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends while holding the slot so a consumer reclaiming its sender
    /// either gets it back or finds the delivery already in its channel.
    fn try_hand_off(&self, delivery: Delivery) -> Result<(), Delivery> {
        let mut slot = self.waiter();
        match slot.take() {
            Some(waiter) => waiter.send(delivery),
            None => Err(delivery),
        }
    }
}

pub struct JobRegistry {
    jobs: DashMap<String, Arc<JobRecord>>,
    timeouts: ContinuationTimeouts,
    retired: AtomicU64,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(ContinuationTimeouts::default())
    }
}

impl JobRegistry {
    pub fn new(timeouts: ContinuationTimeouts) -> Self {
        Self {
            jobs: DashMap::new(),
            timeouts,
            retired: AtomicU64::new(0),
        }
    }

    pub fn timeouts(&self) -> ContinuationTimeouts {
        self.timeouts
    }

    pub fn create(self: &Arc<Self>) -> JobTicket {
        let id = Uuid::new_v4().to_string();
        let record = Arc::new(JobRecord {
            id: id.clone(),
            created_at: Utc::now(),
            waiter: Mutex::new(None),
            waiter_arrived: Notify::new(),
        });
        self.jobs.insert(id.clone(), Arc::clone(&record));
        debug!(job_id = %id, "job registered");

        JobTicket {
            registry: Arc::clone(self),
            record,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Number of jobs removed from the registry since startup.
    pub fn retired_count(&self) -> u64 {
        self.retired.load(Ordering::Acquire)
    }

    /// Blocks until the job's response is ready, the job ends without one,
    /// or the safety timeout elapses.
    pub async fn wait(&self, id: &str) -> WaitOutcome {
        let Some(record) = self.jobs.get(id).map(|entry| Arc::clone(entry.value())) else {
            return WaitOutcome::NotFound;
        };

        let (tx, mut rx) = oneshot::channel();
        *record.waiter() = Some(tx);

        // retired between lookup and registration
        if !self.contains(id) {
            record.waiter().take();
            return WaitOutcome::Closed;
        }
        record.waiter_arrived.notify_one();

        match tokio::time::timeout(self.timeouts.wait_safety, &mut rx).await {
            Ok(Ok(delivery)) => WaitOutcome::Ready(delivery.into_response()),
            // displaced by a newer poll for the same job
            Ok(Err(_)) if self.contains(id) => WaitOutcome::StillRunning,
            Ok(Err(_)) => WaitOutcome::Closed,
            Err(_) => {
                record.waiter().take();
                match rx.try_recv() {
                    Ok(delivery) => WaitOutcome::Ready(delivery.into_response()),
                    Err(_) => WaitOutcome::StillRunning,
                }
            }
        }
    }

    fn retire(&self, id: &str) {
        if let Some((_, record)) = self.jobs.remove(id) {
            record.waiter().take();
            self.retired.fetch_add(1, Ordering::AcqRel);
            let age = Utc::now() - record.created_at;
            debug!(job_id = %id, age_ms = age.num_milliseconds(), "job retired");
        }
    }
}

/// Producer side of a job. Dropping the ticket retires the job.
pub struct JobTicket {
    registry: Arc<JobRegistry>,
    record: Arc<JobRecord>,
}

impl JobTicket {
    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    /// Hands `response` to the next consumer and waits for it to be written.
    pub async fn deliver(&self, response: Response) -> DeliveryOutcome {
        let timeouts = self.registry.timeouts;
        let (ack_tx, ack_rx) = oneshot::channel();
        let mut delivery = Delivery {
            response,
            ack: ack_tx,
        };

        let record = &self.record;
        let handoff = async move {
            loop {
                match record.try_hand_off(delivery) {
                    Ok(()) => return,
                    Err(returned) => delivery = returned,
                }
                record.waiter_arrived.notified().await;
            }
        };

        if tokio::time::timeout(timeouts.delivery, handoff).await.is_err() {
            warn!(job_id = %self.id(), "no client collected the job result in time");
            return DeliveryOutcome::Abandoned;
        }

        match tokio::time::timeout(timeouts.ack, ack_rx).await {
            Ok(Ok(())) => DeliveryOutcome::Delivered,
            Ok(Err(_)) => {
                warn!(job_id = %self.id(), "job result was dropped before being sent");
                DeliveryOutcome::Abandoned
            }
            Err(_) => {
                warn!(job_id = %self.id(), "timed out waiting for job result to be sent");
                DeliveryOutcome::AckTimedOut
            }
        }
    }
}

impl Drop for JobTicket {
    fn drop(&mut self) {
        self.registry.retire(&self.record.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    fn fast() -> ContinuationTimeouts {
        ContinuationTimeouts {
            delivery: Duration::from_millis(300),
            ack: Duration::from_millis(200),
            wait_safety: Duration::from_millis(100),
        }
    }

    fn text(body: &'static str) -> Response {
        Response::new(Body::from(body))
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let registry = JobRegistry::default();
        assert!(matches!(registry.wait("nope").await, WaitOutcome::NotFound));
    }

    #[tokio::test]
    async fn result_finished_before_poll_is_delivered() {
        let registry = Arc::new(JobRegistry::new(fast()));
        let ticket = registry.create();
        let id = ticket.id().to_string();

        let producer = tokio::spawn(async move { ticket.deliver(text("done")).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let WaitOutcome::Ready(response) = registry.wait(&id).await else {
            panic!("expected a ready response");
        };
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"done");

        assert_eq!(producer.await.unwrap(), DeliveryOutcome::Delivered);
        assert!(!registry.contains(&id));
        assert_eq!(registry.retired_count(), 1);
    }

    #[tokio::test]
    async fn poll_started_before_result_receives_it() {
        let registry = Arc::new(JobRegistry::new(ContinuationTimeouts {
            wait_safety: Duration::from_secs(2),
            ..fast()
        }));
        let ticket = registry.create();
        let id = ticket.id().to_string();

        let consumer = {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            tokio::spawn(async move {
                match registry.wait(&id).await {
                    WaitOutcome::Ready(response) => {
                        to_bytes(response.into_body(), usize::MAX).await.ok()
                    }
                    _ => None,
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(ticket.deliver(text("late")).await, DeliveryOutcome::Delivered);
        drop(ticket);

        let body = consumer.await.unwrap().expect("consumer got the result");
        assert_eq!(&body[..], b"late");
        assert!(matches!(registry.wait(&id).await, WaitOutcome::NotFound));
    }

    #[tokio::test]
    async fn safety_timeout_asks_client_to_poll_again() {
        let registry = Arc::new(JobRegistry::new(ContinuationTimeouts {
            delivery: Duration::from_secs(2),
            ..fast()
        }));
        let ticket = registry.create();
        let id = ticket.id().to_string();

        assert!(matches!(registry.wait(&id).await, WaitOutcome::StillRunning));
        assert!(registry.contains(&id));

        let producer = tokio::spawn(async move { ticket.deliver(text("eventually")).await });
        let WaitOutcome::Ready(response) = registry.wait(&id).await else {
            panic!("expected a ready response");
        };
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"eventually");
        assert_eq!(producer.await.unwrap(), DeliveryOutcome::Delivered);
    }

    #[tokio::test]
    async fn unclaimed_result_is_abandoned_and_job_retired() {
        let registry = Arc::new(JobRegistry::new(fast()));
        let ticket = registry.create();
        let id = ticket.id().to_string();

        assert_eq!(ticket.deliver(text("lost")).await, DeliveryOutcome::Abandoned);
        drop(ticket);

        assert!(matches!(registry.wait(&id).await, WaitOutcome::NotFound));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn held_body_times_out_the_ack() {
        let registry = Arc::new(JobRegistry::new(fast()));
        let ticket = registry.create();
        let id = ticket.id().to_string();

        let producer = tokio::spawn(async move { ticket.deliver(text("slow")).await });
        let WaitOutcome::Ready(response) = registry.wait(&id).await else {
            panic!("expected a ready response");
        };

        assert_eq!(producer.await.unwrap(), DeliveryOutcome::AckTimedOut);
        drop(response);
    }

    #[tokio::test]
    async fn job_ending_without_result_closes_the_waiter() {
        let registry = Arc::new(JobRegistry::new(ContinuationTimeouts {
            wait_safety: Duration::from_secs(2),
            ..fast()
        }));
        let ticket = registry.create();
        let id = ticket.id().to_string();

        let consumer = {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            tokio::spawn(async move { matches!(registry.wait(&id).await, WaitOutcome::Closed) })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(ticket);

        assert!(consumer.await.unwrap());
    }

    #[tokio::test]
    async fn retirement_happens_once() {
        let registry = Arc::new(JobRegistry::new(fast()));
        let ticket = registry.create();
        let id = ticket.id().to_string();

        registry.retire(&id);
        drop(ticket);
        registry.retire(&id);

        assert_eq!(registry.retired_count(), 1);
        assert!(registry.is_empty());
    }
}
