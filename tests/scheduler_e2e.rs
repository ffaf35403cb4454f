//! Write scheduler against a background writer thread.
//!
//! The substrate here blocks each write until the test opens a gate, which
//! holds a save in flight for as long as a test needs.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};

use dossier::gateway::DEFAULT_DOCUMENT_KEY;
use dossier::{
    EntityId, EvictionPolicy, GatewayConfig, InMemorySubstrate, ManualClock, PersistenceGateway,
    RecordStore, SaveStatus, SchedulerConfig, SchedulerState, Session, Snapshot, StoreConfig,
    Substrate, SubstrateError, WriteScheduler,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct GatedSubstrate {
    inner: InMemorySubstrate,
    gate: Receiver<()>,
}

impl GatedSubstrate {
    fn new() -> (Arc<Self>, Sender<()>) {
        let (tx, rx) = bounded(16);
        let substrate = Arc::new(Self {
            inner: InMemorySubstrate::new(),
            gate: rx,
        });
        (substrate, tx)
    }
}

impl Substrate for GatedSubstrate {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, SubstrateError> {
        self.inner.read(key)
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), SubstrateError> {
        self.gate
            .recv_timeout(WAIT)
            .map_err(|_| SubstrateError::Unavailable("gate never opened".to_string()))?;
        self.inner.write(key, value)
    }

    fn remove(&self, key: &str) -> Result<bool, SubstrateError> {
        self.inner.remove(key)
    }

    fn used_bytes(&self) -> Result<u64, SubstrateError> {
        self.inner.used_bytes()
    }

    fn capacity(&self) -> Option<u64> {
        None
    }
}

struct Harness {
    substrate: Arc<GatedSubstrate>,
    gate: Sender<()>,
    store: RecordStore,
    scheduler: WriteScheduler,
    t0: Instant,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()));
    let (substrate, gate) = GatedSubstrate::new();
    let gateway = Arc::new(PersistenceGateway::new(
        substrate.clone(),
        EvictionPolicy::default(),
        clock.clone(),
        GatewayConfig::default(),
    ));
    Harness {
        substrate,
        gate,
        store: RecordStore::new(StoreConfig::default(), clock),
        scheduler: WriteScheduler::threaded(SchedulerConfig::default(), gateway).unwrap(),
        t0: Instant::now(),
    }
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

impl Harness {
    fn mutate(&mut self, at: Duration, name: &str) {
        self.store.upsert(&EntityId::new(name).unwrap(), |r| {
            r.set_field("seen", true);
        });
        self.scheduler.notify_mutation(self.t0 + at);
    }

    fn poll(&mut self, at: Duration) -> SchedulerState {
        self.scheduler.poll(self.t0 + at, &self.store).unwrap()
    }

    fn stored(&self) -> Option<Snapshot> {
        self.substrate
            .inner
            .peek(DEFAULT_DOCUMENT_KEY)
            .map(|bytes| Snapshot::from_bytes(&bytes).unwrap())
    }
}

#[test]
fn test_save_runs_on_writer_thread() {
    let mut h = harness();
    h.mutate(ms(0), "A");

    assert_eq!(h.poll(ms(400)), SchedulerState::Saving);
    assert!(h.scheduler.is_saving());

    h.gate.send(()).unwrap();
    assert!(h.scheduler.await_in_flight(&h.store, WAIT));
    assert_eq!(h.scheduler.state(), SchedulerState::Idle);
    assert_eq!(h.stored().unwrap().record_count(), 1);
}

#[test]
fn test_mutation_during_save_schedules_another() {
    let mut h = harness();
    h.mutate(ms(0), "A");
    assert_eq!(h.poll(ms(400)), SchedulerState::Saving);

    // Mutations keep applying while the write is blocked.
    h.mutate(ms(450), "B");
    assert_eq!(h.store.len(), 2);
    assert_eq!(h.poll(ms(500)), SchedulerState::Saving);

    h.gate.send(()).unwrap();
    assert!(h.scheduler.await_in_flight(&h.store, WAIT));
    assert_eq!(h.scheduler.state(), SchedulerState::Pending);
    assert_eq!(h.stored().unwrap().record_count(), 1);

    assert_eq!(h.poll(ms(850)), SchedulerState::Saving);
    h.gate.send(()).unwrap();
    assert!(h.scheduler.await_in_flight(&h.store, WAIT));
    assert_eq!(h.scheduler.state(), SchedulerState::Idle);
    assert_eq!(h.stored().unwrap().record_count(), 2);
    assert_eq!(h.scheduler.stats().saves_succeeded, 2);
}

#[test]
fn test_reset_discards_in_flight_save() {
    let mut h = harness();
    h.mutate(ms(0), "A");
    assert_eq!(h.poll(ms(400)), SchedulerState::Saving);

    // Let the blocked write finish while reset waits for the gateway.
    let gate = h.gate.clone();
    let opener = thread::spawn(move || {
        thread::sleep(ms(50));
        gate.send(()).unwrap();
    });

    h.scheduler.reset().unwrap();
    h.store.clear();
    opener.join().unwrap();

    assert_eq!(h.scheduler.state(), SchedulerState::Idle);
    assert!(!h.scheduler.is_saving());

    // The stale completion arrives and is ignored.
    thread::sleep(ms(50));
    assert_eq!(h.poll(ms(5_000)), SchedulerState::Idle);
    assert!(h.stored().is_none());
    assert_eq!(h.scheduler.stats().saves_succeeded, 0);
}

#[test]
fn test_status_events_in_order() {
    let mut h = harness();
    let events = h.scheduler.subscribe();
    h.mutate(ms(0), "A");
    h.poll(ms(400));
    h.gate.send(()).unwrap();
    assert!(h.scheduler.await_in_flight(&h.store, WAIT));

    let seen: Vec<SaveStatus> = events.try_iter().collect();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0], SaveStatus::Pending);
    assert_eq!(seen[1], SaveStatus::Saving { attempt: 1 });
    assert!(matches!(seen[2], SaveStatus::Saved { attempt: 1, .. }));
}

#[test]
fn test_threaded_session_close_persists() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let mut session = Session::builder()
        .substrate(substrate.clone())
        .threaded(true)
        .open()
        .unwrap();

    let id = EntityId::new("A").unwrap();
    session.append_image(&id, vec![1; 32], "a.png").unwrap();
    session.tick_at(Instant::now() + Duration::from_secs(1)).unwrap();
    session.close().unwrap();

    let reopened = Session::builder().substrate(substrate).open().unwrap();
    assert_eq!(reopened.get(&id).unwrap().image_count(), 1);
}
