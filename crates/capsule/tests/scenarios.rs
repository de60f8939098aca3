//! End-to-end supervisor scenarios: load, verify, schedule, broker

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use capsule::runtime::runtime_type;
use capsule::seal::{Direction, Endpoint, EnvelopeBuilder, Key, PeerType, TokenSigner};
use capsule::{IoDriver, Natives, Request, Runtime, RuntimeFactory, Status, Supervisor};
use ed25519_dalek::SigningKey;

// --- test I/O driver -----------------------------------------------------

#[derive(Default)]
struct DriverState {
    next_fd: i32,
    fd_endpoint: HashMap<i32, u32>,
    scripted_reads: HashMap<u32, VecDeque<Vec<u8>>>,
    opens: Vec<u32>,
    closes: Vec<u32>,
    reads: usize,
    writes: Vec<(u32, Vec<u8>)>,
}

#[derive(Clone, Default)]
struct MockDriver(Arc<Mutex<DriverState>>);

impl MockDriver {
    fn script_read(&self, endpoint: u32, data: Vec<u8>) {
        self.0
            .lock()
            .unwrap()
            .scripted_reads
            .entry(endpoint)
            .or_default()
            .push_back(data);
    }

    fn writes(&self) -> Vec<(u32, Vec<u8>)> {
        self.0.lock().unwrap().writes.clone()
    }

    fn reads(&self) -> usize {
        self.0.lock().unwrap().reads
    }

    fn closes(&self) -> Vec<u32> {
        self.0.lock().unwrap().closes.clone()
    }
}

impl IoDriver for MockDriver {
    fn open(&mut self, endpoint_id: u32) -> i32 {
        let mut state = self.0.lock().unwrap();
        state.next_fd += 1;
        let fd = 100 + state.next_fd;
        state.fd_endpoint.insert(fd, endpoint_id);
        state.opens.push(endpoint_id);
        fd
    }

    fn close(&mut self, fd: i32) {
        let mut state = self.0.lock().unwrap();
        if let Some(endpoint) = state.fd_endpoint.remove(&fd) {
            state.closes.push(endpoint);
        }
    }

    fn read(&mut self, fd: i32, buf: &mut [u8]) -> isize {
        let mut state = self.0.lock().unwrap();
        state.reads += 1;
        let Some(&endpoint) = state.fd_endpoint.get(&fd) else {
            return -1;
        };
        let Some(data) = state
            .scripted_reads
            .get_mut(&endpoint)
            .and_then(VecDeque::pop_front)
        else {
            return 0;
        };
        let count = data.len().min(buf.len());
        buf[..count].copy_from_slice(&data[..count]);
        count as isize
    }

    fn write(&mut self, fd: i32, buf: &[u8]) -> isize {
        let mut state = self.0.lock().unwrap();
        let Some(&endpoint) = state.fd_endpoint.get(&fd) else {
            return -1;
        };
        state.writes.push((endpoint, buf.to_vec()));
        buf.len() as isize
    }
}

// --- test engines --------------------------------------------------------

type Events = Arc<Mutex<Vec<String>>>;

struct FnFactory<F>(F);

impl<F> RuntimeFactory for FnFactory<F>
where
    F: Fn(&[u8], &[u8], Natives) -> Box<dyn Runtime> + Send + Sync,
{
    fn create(&self, data: &[u8], code: &[u8], natives: Natives) -> Option<Box<dyn Runtime>> {
        Some((self.0)(data, code, natives))
    }
}

fn factory<F>(f: F) -> Arc<dyn RuntimeFactory>
where
    F: Fn(&[u8], &[u8], Natives) -> Box<dyn Runtime> + Send + Sync + 'static,
{
    Arc::new(FnFactory(f))
}

/// S1: open both endpoints, copy four bytes from one to the other, exit.
struct EchoEngine {
    natives: Natives,
    events: Events,
}

#[async_trait]
impl Runtime for EchoEngine {
    async fn on_start(&mut self) {
        self.events.lock().unwrap().push("start".into());
    }

    async fn on_loop(&mut self) -> i32 {
        let fd_in = self.natives.open(1).await;
        let fd_out = self.natives.open(2).await;
        let mut buf = [0u8; 4];
        let count = self.natives.read(fd_in, &mut buf).await;
        if count > 0 {
            let written = self.natives.write(fd_out, &buf[..count as usize]).await;
            self.events.lock().unwrap().push(format!("wrote {written}"));
        }
        self.natives.close(fd_in).await;
        self.natives.close(fd_out).await;
        0
    }

    async fn on_stop(&mut self) {
        self.events.lock().unwrap().push("stop".into());
    }

    async fn on_finalize(&mut self) {
        self.events.lock().unwrap().push("finalize".into());
    }
}

/// S2: open is allowed, read must be denied by the capability mask.
struct DeniedReadEngine {
    natives: Natives,
    events: Events,
}

#[async_trait]
impl Runtime for DeniedReadEngine {
    async fn on_start(&mut self) {}

    async fn on_loop(&mut self) -> i32 {
        let fd = self.natives.open(1).await;
        let mut buf = [0u8; 4];
        let count = self.natives.read(fd, &mut buf).await;
        self.events
            .lock()
            .unwrap()
            .push(format!("open {fd} read {count}"));
        0
    }

    async fn on_stop(&mut self) {}

    async fn on_finalize(&mut self) {}
}

/// S5: one eight-byte write, then exit.
struct WriterEngine {
    natives: Natives,
    pattern: u8,
    events: Events,
}

#[async_trait]
impl Runtime for WriterEngine {
    async fn on_start(&mut self) {}

    async fn on_loop(&mut self) -> i32 {
        let fd = self.natives.open(1).await;
        let written = self.natives.write(fd, &[self.pattern; 8]).await;
        self.events.lock().unwrap().push(format!("wrote {written}"));
        self.natives.close(fd).await;
        0
    }

    async fn on_stop(&mut self) {}

    async fn on_finalize(&mut self) {}
}

/// Runs until stopped, publishing the fd it opened.
struct HolderEngine {
    natives: Natives,
    fd_cell: Arc<AtomicI32>,
}

#[async_trait]
impl Runtime for HolderEngine {
    async fn on_start(&mut self) {
        let fd = self.natives.open(1).await;
        self.fd_cell.store(fd, Ordering::SeqCst);
    }

    async fn on_loop(&mut self) -> i32 {
        1
    }

    async fn on_stop(&mut self) {}

    async fn on_finalize(&mut self) {}
}

/// Probes another container's fd; every operation must fail.
struct ThiefEngine {
    natives: Natives,
    fd_cell: Arc<AtomicI32>,
    events: Events,
}

#[async_trait]
impl Runtime for ThiefEngine {
    async fn on_start(&mut self) {}

    async fn on_loop(&mut self) -> i32 {
        let foreign = self.fd_cell.load(Ordering::SeqCst);
        if foreign == 0 {
            return 1; // holder not ready yet
        }
        let mut buf = [0u8; 4];
        let read = self.natives.read(foreign, &mut buf).await;
        let closed = self.natives.close(foreign).await;
        self.events
            .lock()
            .unwrap()
            .push(format!("read {read} close {closed}"));
        0
    }

    async fn on_stop(&mut self) {}

    async fn on_finalize(&mut self) {}
}

/// Loops until stopped.
struct ForeverEngine;

#[async_trait]
impl Runtime for ForeverEngine {
    async fn on_start(&mut self) {}

    async fn on_loop(&mut self) -> i32 {
        1
    }

    async fn on_stop(&mut self) {}

    async fn on_finalize(&mut self) {}
}

/// Records loop entry timestamps to check the scheduling period.
struct TickerEngine {
    ticks: Arc<Mutex<Vec<tokio::time::Instant>>>,
    rounds: u32,
}

#[async_trait]
impl Runtime for TickerEngine {
    async fn on_start(&mut self) {}

    async fn on_loop(&mut self) -> i32 {
        self.ticks.lock().unwrap().push(tokio::time::Instant::now());
        self.rounds -= 1;
        if self.rounds == 0 {
            0
        } else {
            1
        }
    }

    async fn on_stop(&mut self) {}

    async fn on_finalize(&mut self) {}
}

// --- fixtures ------------------------------------------------------------

fn trace_init() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_signer() -> (TokenSigner, Key) {
    let signing_key = SigningKey::from_bytes(&[5u8; 32]);
    let key = Key::Ed25519(signing_key.verifying_key());
    (TokenSigner::Ed25519(signing_key), key)
}

fn local_endpoint(id: u32, peer: u32, direction: Direction) -> Endpoint {
    Endpoint {
        id,
        peer_type: PeerType::Local,
        peer_uid: None,
        peer_endpoint_id: peer,
        direction,
        token: None,
    }
}

fn echo_metadata(uid: &[u8], mask: u32) -> Vec<u8> {
    let (signer, _) = test_signer();
    EnvelopeBuilder::new(uid.to_vec(), runtime_type::WASM)
        .endpoint(local_endpoint(1, 10, Direction::In))
        .endpoint(local_endpoint(2, 10, Direction::Out))
        .syscall_mask(mask)
        .loop_period(10)
        .build(&signer, b"data", b"code")
        .unwrap()
}

async fn wait_stopped(supervisor: &Supervisor, uid: &[u8]) {
    for _ in 0..400 {
        if !supervisor.is_running(uid).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("container did not stop");
}

async fn wait_running(supervisor: &Supervisor, uid: &[u8]) {
    for _ in 0..400 {
        if supervisor.is_running(uid).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("container did not start");
}

// --- scenarios -----------------------------------------------------------

#[tokio::test]
async fn s1_happy_path_local_echo() {
    trace_init();
    let (_, key) = test_signer();
    let driver = MockDriver::default();
    driver.script_read(10, vec![0xDE, 0xAD, 0xBE, 0xEF]);

    let events: Events = Events::default();
    let engine_events = events.clone();
    let supervisor = Supervisor::builder()
        .driver(driver.clone())
        .device_key(key)
        .engine(
            runtime_type::WASM,
            factory(move |_data, _code, natives| {
                Box::new(EchoEngine {
                    natives,
                    events: engine_events.clone(),
                })
            }),
        )
        .unwrap()
        .init();

    let metadata = echo_metadata(b"echo", 0b11111);
    assert!(supervisor.load(&metadata, b"data", b"code").await);
    assert!(supervisor.start(b"echo").await);
    wait_stopped(&supervisor, b"echo").await;

    assert_eq!(driver.writes(), vec![(10, vec![0xDE, 0xAD, 0xBE, 0xEF])]);
    let events = events.lock().unwrap().clone();
    assert_eq!(events, vec!["start", "wrote 4", "stop", "finalize"]);
}

#[tokio::test]
async fn s2_capability_denial_blocks_read() {
    let (_, key) = test_signer();
    let driver = MockDriver::default();
    driver.script_read(10, vec![1, 2, 3, 4]);

    let events: Events = Events::default();
    let engine_events = events.clone();
    let supervisor = Supervisor::builder()
        .driver(driver.clone())
        .device_key(key)
        .engine(
            runtime_type::WASM,
            factory(move |_data, _code, natives| {
                Box::new(DeniedReadEngine {
                    natives,
                    events: engine_events.clone(),
                })
            }),
        )
        .unwrap()
        .init();

    // only OPEN is granted
    let metadata = echo_metadata(b"denied", 0b00010);
    assert!(supervisor.load(&metadata, b"data", b"code").await);
    assert!(supervisor.start(b"denied").await);
    wait_stopped(&supervisor, b"denied").await;

    let events = events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert!(events[0].ends_with("read -1"), "events: {events:?}");
    assert_eq!(driver.reads(), 0);
}

#[tokio::test]
async fn s3_flipped_signature_rejects_load() {
    let (_, key) = test_signer();
    let supervisor = Supervisor::builder().device_key(key).init();

    let mut metadata = echo_metadata(b"forged", 0b11111);
    let last = metadata.len() - 1;
    metadata[last] ^= 0x01;
    assert!(!supervisor.load(&metadata, b"data", b"code").await);

    // the failed load released its slot: a full house still fits
    for slot in 0..3u8 {
        let uid = [b'u', slot];
        let metadata = echo_metadata(&uid, 0b11111);
        assert!(supervisor.load(&metadata, b"data", b"code").await);
    }
}

#[tokio::test]
async fn s4_slot_exhaustion() {
    let (_, key) = test_signer();
    let events: Events = Events::default();
    let engine_events = events.clone();
    let driver = MockDriver::default();
    let supervisor = Supervisor::builder()
        .driver(driver)
        .device_key(key)
        .engine(
            runtime_type::WASM,
            factory(move |_data, _code, natives| {
                Box::new(EchoEngine {
                    natives,
                    events: engine_events.clone(),
                })
            }),
        )
        .unwrap()
        .init();

    for slot in 0..3u8 {
        let uid = [b'c', slot];
        assert!(supervisor.load(&echo_metadata(&uid, 0b11111), b"data", b"code").await);
    }
    assert!(
        !supervisor
            .load(&echo_metadata(b"c4", 0b11111), b"data", b"code")
            .await
    );

    // the earlier containers are unharmed and startable
    assert!(supervisor.start(&[b'c', 0]).await);
    wait_stopped(&supervisor, &[b'c', 0]).await;
}

#[tokio::test]
async fn s5_contended_mailbox_serializes_writes() {
    trace_init();
    let (signer, key) = test_signer();
    let driver = MockDriver::default();
    let events: Events = Events::default();
    let engine_events = events.clone();

    let supervisor = Supervisor::builder()
        .driver(driver.clone())
        .device_key(key)
        .engine(
            runtime_type::WASM,
            factory(move |data, _code, natives| {
                Box::new(WriterEngine {
                    natives,
                    pattern: data[0],
                    events: engine_events.clone(),
                })
            }),
        )
        .unwrap()
        .init();

    for (uid, peer, pattern) in [(b"wr-a", 20u32, 0xA1u8), (b"wr-b", 21, 0xB2)] {
        let metadata = EnvelopeBuilder::new(uid.to_vec(), runtime_type::WASM)
            .endpoint(local_endpoint(1, peer, Direction::Out))
            .loop_period(5)
            .build(&signer, &[pattern], b"code")
            .unwrap();
        assert!(supervisor.load(&metadata, &[pattern], b"code").await);
    }

    assert!(supervisor.start(b"wr-a").await);
    assert!(supervisor.start(b"wr-b").await);
    wait_stopped(&supervisor, b"wr-a").await;
    wait_stopped(&supervisor, b"wr-b").await;

    let mut writes = driver.writes();
    writes.sort();
    assert_eq!(
        writes,
        vec![(20, vec![0xA1; 8]), (21, vec![0xB2; 8])]
    );
    let events = events.lock().unwrap().clone();
    assert_eq!(events, vec!["wrote 8", "wrote 8"]);
}

#[tokio::test]
async fn s6_sealed_code_refuses_controller_writes() {
    let (_, key) = test_signer();
    let events: Events = Events::default();
    let engine_events = events.clone();
    let driver = MockDriver::default();
    let supervisor = Supervisor::builder()
        .driver(driver)
        .device_key(key)
        .engine(
            runtime_type::WASM,
            factory(move |_data, _code, natives| {
                Box::new(EchoEngine {
                    natives,
                    events: engine_events.clone(),
                })
            }),
        )
        .unwrap()
        .init();

    let metadata = echo_metadata(b"sealed", 0b11111);
    assert!(supervisor.load(&metadata, b"data", b"code").await);

    // code bytes outside a load are protocol errors
    let reply = supervisor
        .controller()
        .request(|reply| Request::CodeByte { byte: 0x90, reply })
        .await;
    assert_eq!(reply.status, Status::Ko);
    let reply = supervisor
        .controller()
        .request(|reply| Request::CodeSize { size: 4, reply })
        .await;
    assert_eq!(reply.status, Status::Ko);

    // the loaded container is untouched
    assert!(supervisor.start(b"sealed").await);
    wait_stopped(&supervisor, b"sealed").await;
}

#[tokio::test]
async fn foreign_fds_are_rejected() {
    let (signer, key) = test_signer();
    let driver = MockDriver::default();
    driver.script_read(30, vec![9, 9, 9]);
    let fd_cell = Arc::new(AtomicI32::new(0));
    let events: Events = Events::default();

    let holder_cell = fd_cell.clone();
    let thief_cell = fd_cell.clone();
    let thief_events = events.clone();

    let supervisor = Supervisor::builder()
        .driver(driver)
        .device_key(key)
        .engine(
            runtime_type::WASM,
            factory(move |_data, _code, natives| {
                Box::new(HolderEngine {
                    natives,
                    fd_cell: holder_cell.clone(),
                })
            }),
        )
        .unwrap()
        .engine(
            runtime_type::JAVASCRIPT,
            factory(move |_data, _code, natives| {
                Box::new(ThiefEngine {
                    natives,
                    fd_cell: thief_cell.clone(),
                    events: thief_events.clone(),
                })
            }),
        )
        .unwrap()
        .init();

    let (holder_uid, thief_uid) = (b"holder", b"thief-");
    let holder_meta = EnvelopeBuilder::new(holder_uid.to_vec(), runtime_type::WASM)
        .endpoint(local_endpoint(1, 30, Direction::Both))
        .loop_period(5)
        .build(&signer, b"", b"h")
        .unwrap();
    let thief_meta = EnvelopeBuilder::new(thief_uid.to_vec(), runtime_type::JAVASCRIPT)
        .loop_period(5)
        .build(&signer, b"", b"t")
        .unwrap();
    assert!(supervisor.load(&holder_meta, b"", b"h").await);
    assert!(supervisor.load(&thief_meta, b"", b"t").await);

    assert!(supervisor.start(holder_uid).await);
    assert!(supervisor.start(thief_uid).await);
    wait_stopped(&supervisor, thief_uid).await;

    assert!(supervisor.stop(holder_uid).await);
    wait_stopped(&supervisor, holder_uid).await;

    let events = events.lock().unwrap().clone();
    assert_eq!(events, vec!["read -1 close -1"]);
}

#[tokio::test(start_paused = true)]
async fn loop_starts_are_spaced_by_the_period() {
    let (signer, key) = test_signer();
    let ticks: Arc<Mutex<Vec<tokio::time::Instant>>> = Arc::default();
    let engine_ticks = ticks.clone();

    let supervisor = Supervisor::builder()
        .device_key(key)
        .engine(
            runtime_type::BPF,
            factory(move |_data, _code, _natives| {
                Box::new(TickerEngine {
                    ticks: engine_ticks.clone(),
                    rounds: 4,
                })
            }),
        )
        .unwrap()
        .init();

    let metadata = EnvelopeBuilder::new(b"tick".to_vec(), runtime_type::BPF)
        .loop_period(100)
        .build(&signer, b"", b"t")
        .unwrap();
    assert!(supervisor.load(&metadata, b"", b"t").await);
    assert!(supervisor.start(b"tick").await);
    wait_stopped(&supervisor, b"tick").await;

    let ticks = ticks.lock().unwrap().clone();
    assert_eq!(ticks.len(), 4);
    for pair in ticks.windows(2) {
        assert_eq!(pair[1] - pair[0], Duration::from_millis(100));
    }
}

#[tokio::test]
async fn stop_is_observed_at_the_loop_boundary() {
    let (signer, key) = test_signer();
    let fd_cell = Arc::new(AtomicI32::new(0));
    let holder_cell = fd_cell.clone();
    let driver = MockDriver::default();

    let supervisor = Supervisor::builder()
        .driver(driver.clone())
        .device_key(key)
        .engine(
            runtime_type::WASM,
            factory(move |_data, _code, natives| {
                Box::new(HolderEngine {
                    natives,
                    fd_cell: holder_cell.clone(),
                })
            }),
        )
        .unwrap()
        .init();

    let metadata = EnvelopeBuilder::new(b"runner".to_vec(), runtime_type::WASM)
        .endpoint(local_endpoint(1, 40, Direction::Both))
        .loop_period(5)
        .build(&signer, b"", b"r")
        .unwrap();
    assert!(supervisor.load(&metadata, b"", b"r").await);

    // stopping something never started reports failure
    assert!(!supervisor.stop(b"runner").await);

    assert!(supervisor.start(b"runner").await);
    wait_running(&supervisor, b"runner").await;
    assert!(supervisor.stop(b"runner").await);
    wait_stopped(&supervisor, b"runner").await;

    // the worker's fds were reclaimed on exit, releasing the driver fd
    for _ in 0..100 {
        if driver.closes() == vec![40] {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("driver fd was not released, closes: {:?}", driver.closes());
}

#[tokio::test]
async fn delete_frees_the_slot_and_forgets_the_uid() {
    let (signer, key) = test_signer();
    let supervisor = Supervisor::builder()
        .device_key(key)
        .engine(
            runtime_type::WASM,
            factory(|_data, _code, _natives| Box::new(ForeverEngine)),
        )
        .unwrap()
        .init();

    // fill every slot
    for slot in 0..3u8 {
        let uid = [b'd', slot];
        assert!(supervisor.load(&echo_metadata(&uid, 0b11111), b"data", b"code").await);
    }

    assert!(supervisor.delete(&[b'd', 1]).await);
    assert!(!supervisor.is_running(&[b'd', 1]).await);
    assert!(!supervisor.start(&[b'd', 1]).await);

    // the slot is reusable, including for the same uid
    assert!(
        supervisor
            .load(&echo_metadata(&[b'd', 1], 0b11111), b"data", b"code")
            .await
    );

    // a running container cannot be deleted until it stops
    let runner = EnvelopeBuilder::new(b"d-run".to_vec(), runtime_type::WASM)
        .loop_period(5)
        .build(&signer, b"", b"r")
        .unwrap();
    assert!(supervisor.delete(&[b'd', 0]).await);
    assert!(supervisor.load(&runner, b"", b"r").await);
    assert!(supervisor.start(b"d-run").await);
    wait_running(&supervisor, b"d-run").await;
    assert!(!supervisor.delete(b"d-run").await);

    assert!(supervisor.stop(b"d-run").await);
    wait_stopped(&supervisor, b"d-run").await;
    assert!(supervisor.delete(b"d-run").await);
    assert!(!supervisor.start(b"d-run").await);
}
