//! Uniform guest-engine interface and the per-container worker
//!
//! Engines implement [`Runtime`] and register a factory per metadata
//! discriminant. The worker task created at START resolves its slot,
//! fetches its sections, instantiates the engine and drives the periodic
//! loop; every privileged operation a guest needs goes through the
//! [`Natives`] forwarders and the single `service_syscall` round-trip.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use crate::config::{IO_BUF, MAX_HANDLES_PER_ENGINE};
use crate::error::{SupervisorError, SupervisorResult};
use crate::memmgr::MemoryManager;
use crate::service::{ServiceClient, WorkerSignals};
use crate::shared::{self, SharedMemory};
use crate::sthread::{self, Pid};

/// Engine discriminants carried in container metadata.
pub mod runtime_type {
    pub const UNDEFINED: u8 = 0;
    pub const NATIVE: u8 = 1;
    pub const SHELL: u8 = 2;
    pub const BPF: u8 = 3;
    pub const WASM: u8 = 4;
    pub const JAVACARD: u8 = 5;
    pub const JAVASCRIPT: u8 = 6;
    pub const PYTHON: u8 = 7;
}

/// The uniform interface a guest engine implements.
///
/// A handle is only ever driven from its owning worker task; engines need
/// not be reentrant. Guests must not block internally: anything that waits
/// goes through [`Natives`].
#[async_trait]
pub trait Runtime: Send {
    async fn on_start(&mut self);

    /// One loop iteration. Returns `0` when the guest is done, a negative
    /// value on error, and any positive value to be scheduled again.
    async fn on_loop(&mut self) -> i32;

    async fn on_stop(&mut self);

    async fn on_finalize(&mut self);
}

/// Constructs guest instances for one engine family.
pub trait RuntimeFactory: Send + Sync {
    fn create(&self, data: &[u8], code: &[u8], natives: Natives) -> Option<Box<dyn Runtime>>;
}

struct RegistryInner {
    factories: HashMap<u8, Arc<dyn RuntimeFactory>>,
    live: HashMap<u8, usize>,
}

/// Engine factories keyed by runtime-type discriminant.
pub struct RuntimeRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                factories: HashMap::new(),
                live: HashMap::new(),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(
        &self,
        runtime_type: u8,
        factory: Arc<dyn RuntimeFactory>,
    ) -> SupervisorResult<()> {
        let mut inner = self.inner();
        if inner.factories.contains_key(&runtime_type) {
            return Err(SupervisorError::DuplicateEngine(runtime_type));
        }
        inner.factories.insert(runtime_type, factory);
        Ok(())
    }
}

/// Instantiate a guest, holding a live-instance lease against the
/// per-engine cap.
fn instantiate(
    registry: &Arc<RuntimeRegistry>,
    runtime_type: u8,
    data: &[u8],
    code: &[u8],
    natives: Natives,
) -> Option<(Box<dyn Runtime>, EngineLease)> {
    let factory = {
        let mut inner = registry.inner();
        let factory = inner.factories.get(&runtime_type)?.clone();
        let live = inner.live.entry(runtime_type).or_insert(0);
        if *live >= MAX_HANDLES_PER_ENGINE {
            warn!(runtime_type, "engine handle limit reached");
            return None;
        }
        *live += 1;
        factory
    };
    let lease = EngineLease {
        registry: registry.clone(),
        runtime_type,
    };
    let guest = factory.create(data, code, natives);
    guest.map(|guest| (guest, lease))
}

/// Releases an engine's live-instance slot on drop.
struct EngineLease {
    registry: Arc<RuntimeRegistry>,
    runtime_type: u8,
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        let mut inner = self.registry.inner();
        if let Some(live) = inner.live.get_mut(&self.runtime_type) {
            *live = live.saturating_sub(1);
        }
    }
}

/// Privileged operations available to a guest, forwarded over the
/// shared-memory ABI.
#[derive(Clone)]
pub struct Natives {
    shared: Arc<SharedMemory>,
    service: ServiceClient,
    pid: Pid,
}

impl Natives {
    pub(crate) fn new(shared: Arc<SharedMemory>, service: ServiceClient, pid: Pid) -> Self {
        Self {
            shared,
            service,
            pid,
        }
    }

    /// Guest console output, routed to the supervisor's logger.
    pub fn log(&self, message: &str) {
        info!(target: "guest", pid = self.pid.0, "{message}");
    }

    pub async fn heartbeat(&self) -> i32 {
        {
            let mut rw = self.shared.rw();
            rw.syscall_id = shared::SYSCALL_HEARTBEAT;
        }
        self.service.syscall(self.pid).await
    }

    /// Open one of this container's declared endpoints; returns an fd.
    pub async fn open(&self, endpoint_id: u32) -> i32 {
        {
            let mut rw = self.shared.rw();
            rw.syscall_id = shared::SYSCALL_OPEN;
            rw.fd = endpoint_id as i32;
        }
        self.service.syscall(self.pid).await
    }

    pub async fn close(&self, fd: i32) -> i32 {
        {
            let mut rw = self.shared.rw();
            rw.syscall_id = shared::SYSCALL_CLOSE;
            rw.fd = fd;
        }
        self.service.syscall(self.pid).await
    }

    /// Read from an open endpoint; a single shared-memory window per call.
    pub async fn read(&self, fd: i32, buf: &mut [u8]) -> i32 {
        let window = buf.len().min(IO_BUF);
        {
            let mut rw = self.shared.rw();
            rw.syscall_id = shared::SYSCALL_READ;
            rw.fd = fd;
            rw.size = window as u32;
        }
        let count = self.service.syscall(self.pid).await;
        if count > 0 {
            let count = (count as usize).min(window);
            let rw = self.shared.rw();
            buf[..count].copy_from_slice(&rw.buffer[..count]);
        }
        count
    }

    /// Write to an open endpoint, chunked into shared-memory windows.
    pub async fn write(&self, fd: i32, buf: &[u8]) -> i32 {
        if buf.is_empty() {
            return -1;
        }
        let mut written = 0usize;
        for chunk in buf.chunks(IO_BUF) {
            {
                let mut rw = self.shared.rw();
                rw.syscall_id = shared::SYSCALL_WRITE;
                rw.fd = fd;
                rw.size = chunk.len() as u32;
                rw.buffer[..chunk.len()].copy_from_slice(chunk);
            }
            let count = self.service.syscall(self.pid).await;
            if count < 0 {
                return if written == 0 { -1 } else { written as i32 };
            }
            written += count as usize;
            if (count as usize) < chunk.len() {
                break;
            }
        }
        written as i32
    }
}

/// Everything a worker needs besides its sandbox context.
pub(crate) struct WorkerEnv {
    pub service: ServiceClient,
    pub memmgr: Arc<Mutex<MemoryManager>>,
    pub registry: Arc<RuntimeRegistry>,
    pub signals: Arc<WorkerSignals>,
}

/// Entry function of a container worker task.
pub(crate) async fn worker_main(pid: Pid, env: WorkerEnv) {
    let Some(slot) = env.service.slot_id_for(pid).await else {
        warn!(pid = pid.0, "worker has no slot");
        return;
    };
    let Some(shared) = sthread::callee_context::<SharedMemory>() else {
        warn!(pid = pid.0, "worker has no shared region");
        return;
    };

    let (sections, timing, runtime_type) = {
        let memmgr = env.memmgr.lock().unwrap_or_else(PoisonError::into_inner);
        (
            memmgr.sections(slot),
            memmgr.timing(slot),
            memmgr.runtime_type(slot),
        )
    };
    let (Some((_meta, code, data)), Some(timing), Some(runtime_type)) =
        (sections, timing, runtime_type)
    else {
        warn!(slot, "container image unavailable");
        return;
    };

    let natives = Natives::new(shared.clone(), env.service.clone(), pid);
    let Some((mut guest, _lease)) = instantiate(&env.registry, runtime_type, &data, &code, natives)
    else {
        warn!(slot, runtime_type, "no engine for container");
        return;
    };

    debug!(slot, pid = pid.0, "guest starting");
    guest.on_start().await;

    let period = Duration::from_millis(shared.ro.loop_period_ms.max(1) as u64);
    let mut ticker = interval(period);
    ticker.tick().await; // the first tick completes immediately

    let loop_budget = Duration::from_millis(timing.loop_max_duration as u64);
    let mut invocations: u32 = 0;
    loop {
        if env.signals.stopping.load(Ordering::Relaxed) {
            debug!(slot, "stop observed at loop boundary");
            break;
        }
        let entered = Instant::now();
        let rc = guest.on_loop().await;
        invocations = invocations.saturating_add(1);
        if rc == 0 {
            debug!(slot, "guest finished");
            break;
        }
        if rc < 0 {
            warn!(slot, rc, "guest loop failed");
            break;
        }
        if timing.loop_max_duration != 0 && entered.elapsed() > loop_budget {
            warn!(slot, "loop exceeded its time budget");
            break;
        }
        if timing.loop_max_lifetime != 0 && invocations >= timing.loop_max_lifetime {
            debug!(slot, "loop lifetime exhausted");
            break;
        }
        ticker.tick().await;
    }

    guest.on_stop().await;
    guest.on_finalize().await;
    debug!(slot, pid = pid.0, "guest finalized");
}
