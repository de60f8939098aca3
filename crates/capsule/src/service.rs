//! Container scheduler and syscall broker
//!
//! One actor task owns the per-container bookkeeping and the endpoint fd
//! table. It spawns a sandbox-wrapped worker per started container and is
//! the sole recipient of `service_syscall` round-trips: it validates the
//! caller's capability mask on every call, then delegates endpoint I/O to
//! the controller's mailbox protocol.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use capsule_seal::PeerType;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{IO_BUF, MAX_SLOTS};
use crate::controller::ControllerClient;
use crate::endpoint::{FdTable, Peer};
use crate::memmgr::{MemoryManager, SlotId};
use crate::runtime::{worker_main, RuntimeRegistry, WorkerEnv};
use crate::shared::{self, SharedMemory};
use crate::sthread::{self, Pid, SpawnOptions, INVALID_PID};

pub(crate) enum Msg {
    Run {
        slot: SlotId,
        reply: oneshot::Sender<bool>,
    },
    Stop {
        slot: SlotId,
        reply: oneshot::Sender<bool>,
    },
    IsRunning {
        slot: SlotId,
        reply: oneshot::Sender<bool>,
    },
    Delete {
        slot: SlotId,
        reply: oneshot::Sender<bool>,
    },
    SlotIdFor {
        pid: Pid,
        reply: oneshot::Sender<Option<SlotId>>,
    },
    Syscall {
        pid: Pid,
        reply: oneshot::Sender<i32>,
    },
    WorkerExited {
        pid: Pid,
    },
}

/// Flags a worker polls at its loop boundary.
pub(crate) struct WorkerSignals {
    pub stopping: AtomicBool,
}

struct SlotRecord {
    pid: Pid,
    running: bool,
    stopping: bool,
    shared: Option<Arc<SharedMemory>>,
    signals: Option<Arc<WorkerSignals>>,
}

impl Default for SlotRecord {
    fn default() -> Self {
        Self {
            pid: INVALID_PID,
            running: false,
            stopping: false,
            shared: None,
            signals: None,
        }
    }
}

struct Service {
    memmgr: Arc<Mutex<MemoryManager>>,
    controller: ControllerClient,
    registry: Arc<RuntimeRegistry>,
    fds: FdTable,
    slots: [SlotRecord; MAX_SLOTS],
    container_priority: u8,
    self_tx: mpsc::UnboundedSender<Msg>,
    pid: Pid,
}

impl Service {
    fn memmgr(&self) -> MutexGuard<'_, MemoryManager> {
        self.memmgr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot_for_pid(&self, pid: Pid) -> Option<SlotId> {
        self.slots
            .iter()
            .position(|record| record.pid == pid && record.pid != INVALID_PID)
    }

    async fn run(mut self, pid: Pid, mut rx: mpsc::UnboundedReceiver<Msg>) {
        self.pid = pid;
        debug!(pid = pid.0, "service running");
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Run { slot, reply } => {
                    let _ = reply.send(self.handle_run(slot));
                }
                Msg::Stop { slot, reply } => {
                    let _ = reply.send(self.handle_stop(slot));
                }
                Msg::IsRunning { slot, reply } => {
                    let _ = reply.send(self.handle_is_running(slot));
                }
                Msg::Delete { slot, reply } => {
                    let _ = reply.send(self.handle_delete(slot).await);
                }
                Msg::SlotIdFor { pid, reply } => {
                    let _ = reply.send(self.slot_for_pid(pid));
                }
                Msg::Syscall { pid, reply } => {
                    let _ = reply.send(self.handle_syscall(pid).await);
                }
                Msg::WorkerExited { pid } => self.handle_worker_exited(pid).await,
            }
        }
    }

    fn handle_run(&mut self, slot: SlotId) -> bool {
        if slot >= MAX_SLOTS {
            return false;
        }
        if self.slots[slot].running {
            info!(slot, "container already started");
            return false;
        }
        let (ready, timing) = {
            let memmgr = self.memmgr();
            (memmgr.is_ready(slot), memmgr.timing(slot))
        };
        if !ready {
            warn!(slot, "container not loaded");
            return false;
        }
        let Some(timing) = timing else {
            return false;
        };

        let shared = SharedMemory::new(timing.loop_period);
        let signals = Arc::new(WorkerSignals {
            stopping: AtomicBool::new(false),
        });
        let env = WorkerEnv {
            service: ServiceClient {
                tx: self.self_tx.clone(),
            },
            memmgr: self.memmgr.clone(),
            registry: self.registry.clone(),
            signals: signals.clone(),
        };
        let exit_tx = self.self_tx.clone();
        let callee: Arc<dyn Any + Send + Sync> = shared.clone();

        let pid = sthread::spawn(
            SpawnOptions {
                name: "container",
                priority: self.container_priority,
            },
            Some(callee),
            Some(Box::new(move |pid| {
                let _ = exit_tx.send(Msg::WorkerExited { pid });
            })),
            move |pid| worker_main(pid, env),
        );
        if pid == INVALID_PID {
            return false;
        }

        let record = &mut self.slots[slot];
        record.pid = pid;
        record.running = true;
        record.stopping = false;
        record.shared = Some(shared);
        record.signals = Some(signals);
        info!(
            slot,
            pid = pid.0,
            period_ms = timing.loop_period,
            "container started"
        );
        true
    }

    /// Cooperative stop: raise the STOPPING flag, observed by the worker at
    /// its next loop boundary.
    fn handle_stop(&mut self, slot: SlotId) -> bool {
        if slot >= MAX_SLOTS || !self.slots[slot].running {
            return false;
        }
        let record = &mut self.slots[slot];
        record.stopping = true;
        if let Some(signals) = &record.signals {
            signals.stopping.store(true, Ordering::Relaxed);
        }
        info!(slot, "stop requested");
        true
    }

    fn handle_is_running(&self, slot: SlotId) -> bool {
        slot < MAX_SLOTS && self.slots[slot].running
    }

    async fn handle_delete(&mut self, slot: SlotId) -> bool {
        if slot >= MAX_SLOTS {
            return false;
        }
        if self.slots[slot].running || self.slots[slot].stopping {
            warn!(slot, "delete refused while running");
            return false;
        }
        if !self.memmgr().is_allocated(slot) {
            return false;
        }
        self.release_slot_fds(slot).await;
        self.memmgr().free(slot);
        info!(slot, "container deleted");
        true
    }

    /// Close every fd the slot owns, releasing downstream driver fds.
    async fn release_slot_fds(&mut self, slot: SlotId) {
        let removed = self.fds.close_all_for(slot as u8);
        for entry in removed {
            match entry.peer {
                Some(Peer::Local { peer_fd }) | Some(Peer::Remote { peer_fd }) => {
                    self.controller.io_close_peer(peer_fd, self.pid).await;
                }
                _ => {}
            }
        }
    }

    async fn handle_worker_exited(&mut self, pid: Pid) {
        let Some(slot) = self.slot_for_pid(pid) else {
            return;
        };
        {
            let record = &mut self.slots[slot];
            record.pid = INVALID_PID;
            record.running = false;
            record.stopping = false;
            record.shared = None;
            record.signals = None;
        }
        self.release_slot_fds(slot).await;
        info!(slot, pid = pid.0, "container exited");
    }

    async fn handle_syscall(&mut self, pid: Pid) -> i32 {
        let Some(slot) = self.slot_for_pid(pid) else {
            warn!(pid = pid.0, "syscall from unknown task");
            return -1;
        };
        let Some(shared) = self.slots[slot].shared.clone() else {
            return -1;
        };

        // the worker is parked in the syscall round-trip; mirror the RW
        // half before any suspension point
        let (syscall_id, fd, size, payload) = {
            let rw = shared.rw();
            (rw.syscall_id, rw.fd, rw.size, rw.buffer)
        };

        let Some(bit) = shared::syscall_capability_bit(syscall_id) else {
            warn!(slot, syscall_id, "unknown syscall");
            return -1;
        };
        let mask = self.memmgr().syscall_mask(slot);
        if mask & bit == 0 {
            warn!(slot, syscall_id, "capability denied");
            return -1;
        }

        match syscall_id {
            shared::SYSCALL_HEARTBEAT => 0,
            shared::SYSCALL_OPEN => self.syscall_open(slot, pid, fd).await,
            shared::SYSCALL_CLOSE => self.syscall_close(slot, pid, fd).await,
            shared::SYSCALL_READ => self.syscall_read(slot, pid, fd, size, &shared).await,
            shared::SYSCALL_WRITE => self.syscall_write(slot, pid, fd, size, &payload).await,
            _ => -1,
        }
    }

    async fn syscall_open(&mut self, slot: SlotId, pid: Pid, endpoint_value: i32) -> i32 {
        if endpoint_value < 0 {
            return -1;
        }
        let Some(endpoint) = self.memmgr().endpoint(slot, endpoint_value as u32) else {
            debug!(slot, endpoint_value, "endpoint not declared");
            return -1;
        };
        // opening an endpoint twice is not allowed
        if self.fds.is_open(slot as u8, endpoint.id) {
            return -1;
        }
        let Some(fd) = self.fds.open(slot as u8, endpoint.id, endpoint.direction) else {
            warn!(slot, "fd table exhausted");
            return -1;
        };

        match endpoint.peer_type {
            PeerType::Container => {
                let peer_slot = endpoint
                    .peer_uid
                    .as_deref()
                    .and_then(|uid| self.memmgr().uid_to_slot(uid));
                match peer_slot {
                    Some(peer_slot) => {
                        self.fds.bind_peer(
                            fd,
                            Peer::Container {
                                slot_id: peer_slot as u8,
                                endpoint_id: endpoint.peer_endpoint_id,
                            },
                        );
                        fd
                    }
                    None => {
                        self.fds.close(fd);
                        -1
                    }
                }
            }
            PeerType::Local | PeerType::Remote => {
                let peer_fd = self.controller.io_open(endpoint.peer_endpoint_id, pid).await;
                if peer_fd <= 0 {
                    self.fds.close(fd);
                    return -1;
                }
                let peer = if endpoint.peer_type == PeerType::Local {
                    Peer::Local { peer_fd }
                } else {
                    Peer::Remote { peer_fd }
                };
                self.fds.bind_peer(fd, peer);
                fd
            }
        }
    }

    async fn syscall_close(&mut self, slot: SlotId, pid: Pid, fd: i32) -> i32 {
        if fd <= 0 {
            return -1;
        }
        let owned = self
            .fds
            .get(fd)
            .is_some_and(|entry| entry.owner_slot == slot as u8);
        if !owned {
            return -1;
        }
        let Some(entry) = self.fds.close(fd) else {
            return -1;
        };
        match entry.peer {
            Some(Peer::Local { peer_fd }) | Some(Peer::Remote { peer_fd }) => {
                self.controller.io_close_peer(peer_fd, pid).await;
            }
            _ => {}
        }
        0
    }

    async fn syscall_read(
        &mut self,
        slot: SlotId,
        pid: Pid,
        fd: i32,
        size: u32,
        shared: &Arc<SharedMemory>,
    ) -> i32 {
        if size == 0 || !self.fds.readable_by(slot as u8, fd) {
            return -1;
        }
        let peer = self.fds.get(fd).and_then(|entry| entry.peer);
        match peer {
            Some(Peer::Local { peer_fd }) | Some(Peer::Remote { peer_fd }) => {
                let cap = (size as usize).min(IO_BUF);
                let mut window = [0u8; IO_BUF];
                let count = self.controller.io_read(peer_fd, &mut window[..cap], pid).await;
                if count < 0 {
                    return -1;
                }
                let count = count as usize;
                shared.rw().buffer[..count].copy_from_slice(&window[..count]);
                count as i32
            }
            // container-to-container routing is not wired up
            _ => -1,
        }
    }

    async fn syscall_write(
        &mut self,
        slot: SlotId,
        pid: Pid,
        fd: i32,
        size: u32,
        payload: &[u8; IO_BUF],
    ) -> i32 {
        if size == 0 || !self.fds.writable_by(slot as u8, fd) {
            return -1;
        }
        let peer = self.fds.get(fd).and_then(|entry| entry.peer);
        match peer {
            Some(Peer::Local { peer_fd }) | Some(Peer::Remote { peer_fd }) => {
                let cap = (size as usize).min(IO_BUF);
                let count = self.controller.io_write(peer_fd, &payload[..cap], pid).await;
                if count < 0 {
                    return -1;
                }
                count as i32
            }
            _ => -1,
        }
    }
}

/// Spawn the service task.
pub(crate) fn spawn(
    self_tx: mpsc::UnboundedSender<Msg>,
    rx: mpsc::UnboundedReceiver<Msg>,
    memmgr: Arc<Mutex<MemoryManager>>,
    registry: Arc<RuntimeRegistry>,
    controller: ControllerClient,
    service_priority: u8,
    container_priority: u8,
) -> Pid {
    let service = Service {
        memmgr,
        controller,
        registry,
        fds: FdTable::new(),
        slots: std::array::from_fn(|_| SlotRecord::default()),
        container_priority,
        self_tx,
        pid: INVALID_PID,
    };
    sthread::spawn(
        SpawnOptions {
            name: "service",
            priority: service_priority,
        },
        None,
        None,
        move |pid| service.run(pid, rx),
    )
}

/// Client handle for the service actor.
#[derive(Clone)]
pub(crate) struct ServiceClient {
    pub(crate) tx: mpsc::UnboundedSender<Msg>,
}

impl ServiceClient {
    async fn ask<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Msg, fallback: T) -> T {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(build(tx)).is_err() {
            return fallback;
        }
        rx.await.unwrap_or(fallback)
    }

    pub(crate) async fn start(&self, slot: SlotId) -> bool {
        self.ask(|reply| Msg::Run { slot, reply }, false).await
    }

    pub(crate) async fn stop(&self, slot: SlotId) -> bool {
        self.ask(|reply| Msg::Stop { slot, reply }, false).await
    }

    pub(crate) async fn is_running(&self, slot: SlotId) -> bool {
        self.ask(|reply| Msg::IsRunning { slot, reply }, false).await
    }

    pub(crate) async fn delete(&self, slot: SlotId) -> bool {
        self.ask(|reply| Msg::Delete { slot, reply }, false).await
    }

    pub(crate) async fn slot_id_for(&self, pid: Pid) -> Option<SlotId> {
        self.ask(|reply| Msg::SlotIdFor { pid, reply }, None).await
    }

    /// The single guest entry point: raise the syscall staged in the
    /// caller's shared-memory region.
    pub(crate) async fn syscall(&self, pid: Pid) -> i32 {
        self.ask(|reply| Msg::Syscall { pid, reply }, -1).await
    }
}
