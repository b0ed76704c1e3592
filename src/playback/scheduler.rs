//! Event scheduler
//!
//! One dispatch thread per playing session. The thread sleeps on a condvar
//! until the next event is due (or it is woken by an insert or a cancel),
//! pops every due event, then writes them through the gateway with the queue
//! lock released. Cancelling wakes the thread, which flushes note offs for
//! whatever the session left sounding before it exits, so `cancel` returning
//! means the session is silent. Events popped but never written go back on
//! the queue, so a cancel hands back exactly what was not sent.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use parking_lot::{Condvar, Mutex};

use super::feed::{PlaybackFeed, PlaybackNotice};
use crate::error::PortError;
use crate::midi::{MidiEvent, MidiGateway, NoteOwner, ScheduledEvent};

/// Where a dispatch thread is in its life
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerStatus {
    Running,
    /// Every queued event was dispatched
    Finished,
    Cancelled,
    /// A write failed and the session was aborted
    Failed(PortError),
}

/// Dispatch timing counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    /// Events dispatched later than the jitter tolerance
    pub late: u64,
    pub max_lateness_us: u64,
}

/// Queue key: offset, tie rank, insertion sequence
type QueueKey = (u64, u8, u64);

/// What a cancelled scheduler leaves behind
#[derive(Debug, Clone, PartialEq)]
pub struct CancelReport {
    pub position_us: u64,
    pub status: SchedulerStatus,
    /// Events never written to the port, in dispatch order
    pub unsent: Vec<ScheduledEvent>,
}

#[derive(Default)]
struct EventQueue {
    pending: BTreeMap<QueueKey, MidiEvent>,
    next_seq: u64,
    /// Set once the dispatch thread stops taking events
    closed: bool,
}

impl EventQueue {
    fn push(&mut self, scheduled: &ScheduledEvent) {
        let key = (
            scheduled.offset_us,
            scheduled.event.tie_rank(),
            self.next_seq,
        );
        self.next_seq += 1;
        self.pending.insert(key, scheduled.event);
    }
}

/// State shared with the dispatch thread
struct SchedulerShared {
    session_id: String,
    queue: Mutex<EventQueue>,
    wake: Condvar,
    cancelled: AtomicBool,
    status: Mutex<SchedulerStatus>,
    stats: Mutex<DispatchStats>,
    /// Wall clock at which the sequence reached `base_offset_us`
    started: Instant,
    base_offset_us: u64,
}

impl SchedulerShared {
    fn position_us(&self) -> u64 {
        self.base_offset_us + self.started.elapsed().as_micros() as u64
    }

    /// Wall clock instant an offset is due
    fn due_at(&self, offset_us: u64) -> Instant {
        let ahead = offset_us.saturating_sub(self.base_offset_us);
        self.started + Duration::from_micros(ahead)
    }
}

/// Handle to a session's dispatch thread
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl Scheduler {
    /// Start dispatching `events` with `start_offset_us` mapped to now.
    ///
    /// Events earlier than the start offset are dispatched immediately.
    pub fn start(
        session_id: &str,
        events: &[ScheduledEvent],
        start_offset_us: u64,
        gateway: Arc<MidiGateway>,
        feed: PlaybackFeed,
        jitter_tolerance: Duration,
    ) -> Self {
        let mut queue = EventQueue::default();
        for e in events {
            queue.push(e);
        }

        let shared = Arc::new(SchedulerShared {
            session_id: session_id.to_string(),
            queue: Mutex::new(queue),
            wake: Condvar::new(),
            cancelled: AtomicBool::new(false),
            status: Mutex::new(SchedulerStatus::Running),
            stats: Mutex::new(DispatchStats::default()),
            started: Instant::now(),
            base_offset_us: start_offset_us,
        });

        log::debug!(
            "Scheduler for {} starting at {}us with {} events",
            session_id,
            start_offset_us,
            events.len()
        );

        let shared_clone = Arc::clone(&shared);
        let thread_handle = thread::Builder::new()
            .name(format!("dispatch-{}", session_id))
            .spawn(move || dispatch_thread(shared_clone, gateway, feed, jitter_tolerance));

        let thread_handle = match thread_handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::error!("Failed to spawn dispatch thread for {}: {}", session_id, e);
                *shared.status.lock() =
                    SchedulerStatus::Failed(PortError::IoFailure(e.to_string()));
                None
            }
        };

        Self {
            shared,
            thread_handle,
        }
    }

    /// Merge events into the live queue. Returns how many were queued.
    pub fn insert(&self, events: &[ScheduledEvent]) -> usize {
        let mut queue = self.shared.queue.lock();
        if queue.closed {
            return 0;
        }
        for e in events {
            queue.push(e);
        }
        self.shared.wake.notify_all();
        events.len()
    }

    /// Current playback position in microseconds from sequence start
    pub fn position_us(&self) -> u64 {
        self.shared.position_us()
    }

    pub fn status(&self) -> SchedulerStatus {
        self.shared.status.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.status() == SchedulerStatus::Running
    }

    pub fn stats(&self) -> DispatchStats {
        *self.shared.stats.lock()
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    /// Stop dispatching and wait for the thread to flush and exit
    pub fn cancel(mut self) -> CancelReport {
        let position_us = self.position_us();
        self.shutdown();
        let unsent = std::mem::take(&mut self.shared.queue.lock().pending)
            .into_iter()
            .map(|((offset_us, _, _), event)| ScheduledEvent::new(offset_us, event))
            .collect();
        CancelReport {
            position_us,
            status: self.status(),
            unsent,
        }
    }

    fn shutdown(&mut self) {
        {
            // Taken under the queue lock so the thread cannot miss the wakeup
            let _queue = self.shared.queue.lock();
            self.shared.cancelled.store(true, Ordering::SeqCst);
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                log::error!("Dispatch thread for {} panicked", self.shared.session_id);
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Block until events are due; returns them, or `None` once cancelled or drained
fn next_batch(shared: &SchedulerShared) -> Option<Vec<(QueueKey, MidiEvent)>> {
    let mut queue = shared.queue.lock();
    loop {
        if shared.cancelled.load(Ordering::SeqCst) {
            queue.closed = true;
            return None;
        }

        let next_offset = match queue.pending.keys().next() {
            Some(&(offset, _, _)) => offset,
            None => {
                queue.closed = true;
                return None;
            }
        };

        let position = shared.position_us();
        if next_offset <= position {
            let later = queue.pending.split_off(&(position + 1, 0, 0));
            let due = std::mem::replace(&mut queue.pending, later);
            return Some(due.into_iter().collect());
        }

        let deadline = shared.due_at(next_offset);
        shared.wake.wait_until(&mut queue, deadline);
    }
}

/// Put popped events back under their original keys
fn requeue(shared: &SchedulerShared, unsent: impl Iterator<Item = (QueueKey, MidiEvent)>) {
    shared.queue.lock().pending.extend(unsent);
}

/// Dispatch thread function
fn dispatch_thread(
    shared: Arc<SchedulerShared>,
    gateway: Arc<MidiGateway>,
    feed: PlaybackFeed,
    jitter_tolerance: Duration,
) {
    let owner = NoteOwner::Session(shared.session_id.clone());
    let tolerance_us = jitter_tolerance.as_micros() as u64;
    let mut failure: Option<PortError> = None;

    'dispatch: while let Some(batch) = next_batch(&shared) {
        let mut batch = batch.into_iter();
        while let Some((key, event)) = batch.next() {
            let offset_us = key.0;
            if shared.cancelled.load(Ordering::SeqCst) {
                requeue(&shared, std::iter::once((key, event)).chain(batch));
                break 'dispatch;
            }

            if let Err(e) = gateway.send_as(&owner, &event) {
                log::error!("Playback of {} aborted: {}", shared.session_id, e);
                requeue(&shared, std::iter::once((key, event)).chain(batch));
                failure = Some(e);
                break 'dispatch;
            }

            let lateness_us = shared.due_at(offset_us).elapsed().as_micros() as u64;
            {
                let mut stats = shared.stats.lock();
                stats.dispatched += 1;
                stats.max_lateness_us = stats.max_lateness_us.max(lateness_us);
                if lateness_us > tolerance_us {
                    stats.late += 1;
                    log::debug!(
                        "{}: event at {}us dispatched {}us late",
                        shared.session_id,
                        offset_us,
                        lateness_us
                    );
                }
            }

            feed.publish(PlaybackNotice::Event {
                session_id: shared.session_id.clone(),
                offset_ms: offset_us as f64 / 1000.0,
                late_ms: lateness_us as f64 / 1000.0,
                event,
            });
        }
    }

    shared.queue.lock().closed = true;

    // Silence anything this session started, whatever the reason for exiting
    match gateway.release(&owner) {
        Ok(0) => {}
        Ok(flushed) => log::debug!("{}: flushed {} sounding notes", shared.session_id, flushed),
        Err(e) => log::warn!("{}: note off flush failed: {}", shared.session_id, e),
    }

    let status = if let Some(e) = failure {
        feed.publish(PlaybackNotice::Failed {
            session_id: shared.session_id.clone(),
            error: e.to_string(),
        });
        SchedulerStatus::Failed(e)
    } else if shared.cancelled.load(Ordering::SeqCst) {
        SchedulerStatus::Cancelled
    } else {
        log::info!("Playback of {} finished", shared.session_id);
        feed.publish(PlaybackNotice::Finished {
            session_id: shared.session_id.clone(),
        });
        SchedulerStatus::Finished
    };
    *shared.status.lock() = status;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::MemoryPorts;

    fn setup() -> (MemoryPorts, Arc<MidiGateway>, PlaybackFeed) {
        let ports = MemoryPorts::new();
        let gateway = Arc::new(MidiGateway::new(Arc::new(ports.clone())));
        gateway.connect("0").unwrap();
        (ports, gateway, PlaybackFeed::new(64))
    }

    fn ms(offset: u64, event: MidiEvent) -> ScheduledEvent {
        ScheduledEvent::new(offset * 1000, event)
    }

    fn wait_for_end(scheduler: &Scheduler) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_dispatches_in_order_and_on_time() {
        let (ports, gateway, feed) = setup();
        let events = vec![
            ms(0, MidiEvent::note_on(0, 60, 100)),
            ms(30, MidiEvent::note_off(0, 60)),
            ms(30, MidiEvent::note_on(0, 62, 100)),
            ms(60, MidiEvent::note_off(0, 62)),
        ];
        let begin = Instant::now();
        let scheduler = Scheduler::start("t", &events, 0, gateway, feed, Duration::from_millis(3));
        wait_for_end(&scheduler);

        assert_eq!(scheduler.status(), SchedulerStatus::Finished);
        assert_eq!(
            ports.events(),
            events.iter().map(|e| e.event).collect::<Vec<_>>()
        );
        let messages = ports.messages();
        for (message, expected) in messages.iter().zip(&events) {
            assert!(message.at.duration_since(begin) >= Duration::from_micros(expected.offset_us));
        }
        assert_eq!(scheduler.stats().dispatched, 4);
    }

    #[test]
    fn test_start_offset_skips_ahead() {
        let (ports, gateway, feed) = setup();
        let events = vec![ms(500, MidiEvent::note_on(0, 64, 100))];
        let begin = Instant::now();
        let scheduler = Scheduler::start("t", &events, 480, gateway, feed, Duration::from_millis(3));
        wait_for_end(&scheduler);

        assert_eq!(ports.events(), vec![MidiEvent::note_on(0, 64, 100)]);
        // Due 20ms after start rather than 500ms
        assert!(begin.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn test_cancel_flushes_sounding_notes() {
        let (ports, gateway, feed) = setup();
        let events = vec![
            ms(0, MidiEvent::note_on(0, 60, 100)),
            ms(0, MidiEvent::note_on(1, 67, 100)),
            ms(5_000, MidiEvent::note_off(0, 60)),
            ms(5_000, MidiEvent::note_off(1, 67)),
        ];
        let scheduler = Scheduler::start("t", &events, 0, Arc::clone(&gateway), feed, Duration::from_millis(3));
        thread::sleep(Duration::from_millis(50));

        let cancel_started = Instant::now();
        let report = scheduler.cancel();
        assert!(cancel_started.elapsed() < Duration::from_millis(200));
        assert_eq!(report.status, SchedulerStatus::Cancelled);
        assert!(report.position_us >= 50_000);
        assert_eq!(
            report.unsent,
            vec![
                ms(5_000, MidiEvent::note_off(0, 60)),
                ms(5_000, MidiEvent::note_off(1, 67)),
            ]
        );

        let events = ports.events();
        assert_eq!(events.len(), 4);
        let mut offs: Vec<_> = events[2..].to_vec();
        offs.sort_by_key(|e| e.channel());
        assert_eq!(offs, vec![MidiEvent::note_off(0, 60), MidiEvent::note_off(1, 67)]);
        assert!(gateway.sounding_notes().is_empty());
    }

    #[test]
    fn test_cancel_hands_back_unsent_batch() {
        let (ports, gateway, feed) = setup();
        ports.set_write_delay(Duration::from_millis(30));
        let events: Vec<_> = (0..5u8)
            .map(|i| ms(0, MidiEvent::control_change(0, 7, i)))
            .collect();
        let scheduler = Scheduler::start("t", &events, 0, gateway, feed, Duration::from_millis(3));
        thread::sleep(Duration::from_millis(45));

        let report = scheduler.cancel();
        let mut seen = ports.events();
        assert!(!seen.is_empty() && seen.len() < 5);
        seen.extend(report.unsent.iter().map(|e| e.event));
        assert_eq!(seen, events.iter().map(|e| e.event).collect::<Vec<_>>());
    }

    #[test]
    fn test_insert_merges_into_live_queue() {
        let (ports, gateway, feed) = setup();
        let events = vec![
            ms(0, MidiEvent::note_on(0, 60, 100)),
            ms(150, MidiEvent::note_off(0, 60)),
        ];
        let scheduler = Scheduler::start("t", &events, 0, gateway, feed, Duration::from_millis(3));
        thread::sleep(Duration::from_millis(20));

        let inserted = scheduler.insert(&[
            ms(60, MidiEvent::note_on(1, 72, 90)),
            ms(100, MidiEvent::note_off(1, 72)),
        ]);
        assert_eq!(inserted, 2);
        wait_for_end(&scheduler);

        assert_eq!(
            ports.events(),
            vec![
                MidiEvent::note_on(0, 60, 100),
                MidiEvent::note_on(1, 72, 90),
                MidiEvent::note_off(1, 72),
                MidiEvent::note_off(0, 60),
            ]
        );
        assert_eq!(scheduler.insert(&[ms(0, MidiEvent::note_on(0, 1, 1))]), 0);
    }

    #[test]
    fn test_port_failure_aborts_session() {
        let (ports, gateway, feed) = setup();
        let mut rx = feed.subscribe();
        let events: Vec<_> = (0..50)
            .map(|i| ms(i * 10, MidiEvent::control_change(0, 1, i as u8)))
            .collect();
        let scheduler = Scheduler::start("t", &events, 0, gateway, feed, Duration::from_millis(3));
        thread::sleep(Duration::from_millis(25));
        ports.set_fail_writes(true);
        wait_for_end(&scheduler);

        assert!(matches!(
            scheduler.status(),
            SchedulerStatus::Failed(PortError::IoFailure(_))
        ));
        assert!(scheduler.stats().dispatched < 50);
        assert!(scheduler.pending() > 0);

        let mut saw_failure = false;
        while let Ok(notice) = rx.try_recv() {
            saw_failure |= matches!(notice, PlaybackNotice::Failed { .. });
        }
        assert!(saw_failure);
    }

    #[test]
    fn test_empty_sequence_finishes_immediately() {
        let (_ports, gateway, feed) = setup();
        let mut rx = feed.subscribe();
        let scheduler = Scheduler::start("empty", &[], 0, gateway, feed, Duration::from_millis(3));
        wait_for_end(&scheduler);
        assert_eq!(scheduler.status(), SchedulerStatus::Finished);
        assert_eq!(
            rx.try_recv().unwrap(),
            PlaybackNotice::Finished {
                session_id: "empty".into()
            }
        );
    }
}
