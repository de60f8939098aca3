//! Lifecycle controller
//!
//! A single actor task serializes every lifecycle mutation: the loading
//! state machine, uid resolution, and the endpoint-I/O mailbox through
//! which all driver traffic flows. Lifecycle requests (start/stop/
//! is-running/delete) are forwarded to the service without suspending the
//! controller's own receive loop, so mailbox traffic can never deadlock
//! against them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::yield_now;
use tracing::{debug, warn};

use crate::config::{IO_BUF, MAILBOX_LEASE_MS, UID_MAX};
use crate::driver::IoDriver;
use crate::memmgr::{MemoryManager, SectionFd, SlotId};
use crate::service::ServiceClient;
use crate::sthread::{self, Pid, SpawnOptions};

/// Reply status of a controller request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Ko,
    /// The mailbox is held by another container; yield and retry.
    Retry,
}

/// Reply to a controller request.
#[derive(Debug, Clone, Copy)]
pub struct Reply {
    pub status: Status,
    pub value: u32,
}

impl Reply {
    fn ok(value: u32) -> Self {
        Reply {
            status: Status::Ok,
            value,
        }
    }

    fn ko() -> Self {
        Reply {
            status: Status::Ko,
            value: 0,
        }
    }

    fn retry() -> Self {
        Reply {
            status: Status::Retry,
            value: 0,
        }
    }
}

type RespondTo = oneshot::Sender<Reply>;

/// The controller's request set.
#[derive(Debug)]
pub enum Request {
    Start { slot: u32, reply: RespondTo },
    Stop { slot: u32, reply: RespondTo },
    IsRunning { slot: u32, reply: RespondTo },
    Delete { slot: u32, reply: RespondTo },
    BeginLoad { reply: RespondTo },
    MetaSize { size: u32, reply: RespondTo },
    MetaByte { byte: u32, reply: RespondTo },
    CodeSize { size: u32, reply: RespondTo },
    CodeByte { byte: u32, reply: RespondTo },
    DataSize { size: u32, reply: RespondTo },
    DataByte { byte: u32, reply: RespondTo },
    LoadEnd { reply: RespondTo },
    UidLen { len: u32, reply: RespondTo },
    UidByte { byte: u32, reply: RespondTo },
    GetSlotId { reply: RespondTo },
    IoFd { value: i32, owner: Pid, reply: RespondTo },
    IoSize { value: u32, owner: Pid, reply: RespondTo },
    IoBuffer { value: u8, owner: Pid, reply: RespondTo },
    IoOpen { owner: Pid, reply: RespondTo },
    IoClose { owner: Pid, reply: RespondTo },
    IoRead { index: i32, owner: Pid, reply: RespondTo },
    IoWrite { owner: Pid, reply: RespondTo },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    None,
    Started,
    Meta,
    Code,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UidState {
    Ready,
    Reading,
    Resolve,
}

struct UidQuery {
    state: UidState,
    expect: usize,
    buf: Vec<u8>,
}

impl Default for UidQuery {
    fn default() -> Self {
        Self {
            state: UidState::Ready,
            expect: 0,
            buf: Vec::new(),
        }
    }
}

/// The single shared scratch region for delegated endpoint I/O.
struct Mailbox {
    locked_by: Option<Pid>,
    acquired: Instant,
    fd: i32,
    size: i32,
    buffer: [u8; IO_BUF],
}

impl Mailbox {
    fn new() -> Self {
        Self {
            locked_by: None,
            acquired: Instant::now(),
            fd: -1,
            size: -1,
            buffer: [0; IO_BUF],
        }
    }

    fn clear(&mut self) {
        self.locked_by = None;
        self.fd = -1;
        self.size = -1;
        self.buffer = [0; IO_BUF];
    }

    fn held_by(&self, pid: Pid) -> bool {
        self.locked_by == Some(pid)
    }
}

enum Lifecycle {
    Start,
    Stop,
    IsRunning,
    Delete,
}

struct Controller {
    memmgr: Arc<Mutex<MemoryManager>>,
    service: ServiceClient,
    driver: Box<dyn IoDriver>,
    load_state: LoadState,
    load_slot: Option<SlotId>,
    open_fd: Option<SectionFd>,
    remaining: usize,
    uid: UidQuery,
    mailbox: Mailbox,
}

fn send(reply: RespondTo, value: Reply) {
    let _ = reply.send(value);
}

impl Controller {
    fn memmgr(&self) -> MutexGuard<'_, MemoryManager> {
        self.memmgr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(mut self, pid: Pid, mut rx: mpsc::UnboundedReceiver<Request>) {
        debug!(pid = pid.0, "controller running");
        while let Some(request) = rx.recv().await {
            self.handle(request);
        }
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Start { slot, reply } => self.forward(Lifecycle::Start, slot, reply),
            Request::Stop { slot, reply } => self.forward(Lifecycle::Stop, slot, reply),
            Request::IsRunning { slot, reply } => self.forward(Lifecycle::IsRunning, slot, reply),
            Request::Delete { slot, reply } => self.forward(Lifecycle::Delete, slot, reply),
            Request::BeginLoad { reply } => send(reply, self.begin_load()),
            Request::MetaSize { size, reply } => send(
                reply,
                self.start_section(LoadState::Started, LoadState::Meta, size, Open::Meta),
            ),
            Request::MetaByte { byte, reply } => {
                send(reply, self.write_byte(LoadState::Meta, byte))
            }
            Request::CodeSize { size, reply } => send(
                reply,
                self.start_section(LoadState::Meta, LoadState::Code, size, Open::Code),
            ),
            Request::CodeByte { byte, reply } => {
                send(reply, self.write_byte(LoadState::Code, byte))
            }
            Request::DataSize { size, reply } => send(
                reply,
                self.start_section(LoadState::Code, LoadState::Data, size, Open::Data),
            ),
            Request::DataByte { byte, reply } => {
                send(reply, self.write_byte(LoadState::Data, byte))
            }
            Request::LoadEnd { reply } => send(reply, self.load_end()),
            Request::UidLen { len, reply } => send(reply, self.uid_len(len)),
            Request::UidByte { byte, reply } => send(reply, self.uid_byte(byte)),
            Request::GetSlotId { reply } => send(reply, self.get_slot_id()),
            Request::IoFd { value, owner, reply } => send(reply, self.io_fd(value, owner)),
            Request::IoSize { value, owner, reply } => send(reply, self.io_size(value, owner)),
            Request::IoBuffer { value, owner, reply } => send(reply, self.io_buffer(value, owner)),
            Request::IoOpen { owner, reply } => send(reply, self.io_open(owner)),
            Request::IoClose { owner, reply } => send(reply, self.io_close(owner)),
            Request::IoRead { index, owner, reply } => send(reply, self.io_read(index, owner)),
            Request::IoWrite { owner, reply } => send(reply, self.io_write(owner)),
        }
    }

    /// Hand a lifecycle request to the service; a detached forwarder
    /// completes the caller's reply so the controller loop stays free.
    fn forward(&self, op: Lifecycle, slot: u32, reply: RespondTo) {
        let service = self.service.clone();
        tokio::spawn(async move {
            let slot = slot as SlotId;
            let ok = match op {
                Lifecycle::Start => service.start(slot).await,
                Lifecycle::Stop => service.stop(slot).await,
                Lifecycle::IsRunning => service.is_running(slot).await,
                Lifecycle::Delete => service.delete(slot).await,
            };
            send(reply, if ok { Reply::ok(0) } else { Reply::ko() });
        });
    }

    fn fail_load(&mut self) -> Reply {
        if let Some(fd) = self.open_fd.take() {
            self.memmgr().close(fd);
        }
        if let Some(slot) = self.load_slot.take() {
            self.memmgr().free(slot);
        }
        self.load_state = LoadState::None;
        self.remaining = 0;
        Reply::ko()
    }

    fn begin_load(&mut self) -> Reply {
        if self.load_state != LoadState::None {
            warn!(state = ?self.load_state, "load already in progress");
            return self.fail_load();
        }
        let slot = self.memmgr().new_slot();
        match slot {
            Some(slot) => {
                self.load_slot = Some(slot);
                self.load_state = LoadState::Started;
                debug!(slot, "loading started");
                Reply::ok(0)
            }
            None => {
                warn!("no free slot");
                Reply::ko()
            }
        }
    }

    fn start_section(
        &mut self,
        expected: LoadState,
        next: LoadState,
        size: u32,
        open: Open,
    ) -> Reply {
        if self.load_state != expected || self.remaining != 0 || self.open_fd.is_some() {
            warn!(state = ?self.load_state, expected = ?expected, "section out of order");
            return self.fail_load();
        }
        let Some(slot) = self.load_slot else {
            return self.fail_load();
        };
        let fd = {
            let mut memmgr = self.memmgr();
            match open {
                Open::Meta => memmgr.open_meta(slot),
                Open::Code => memmgr.open_code(slot),
                Open::Data => memmgr.open_data(slot),
            }
        };
        let Some(fd) = fd else {
            warn!(slot, "section open refused");
            return self.fail_load();
        };
        self.remaining = size as usize;
        self.load_state = next;
        if self.remaining == 0 {
            // empty section closes (and, for code, seals) immediately
            self.memmgr().close(fd);
        } else {
            self.open_fd = Some(fd);
        }
        Reply::ok(0)
    }

    fn write_byte(&mut self, expected: LoadState, byte: u32) -> Reply {
        if self.load_state != expected {
            return self.fail_load();
        }
        let Some(fd) = self.open_fd else {
            return self.fail_load();
        };
        if self.remaining == 0 {
            return self.fail_load();
        }
        // a short write means the section overflowed
        if self.memmgr().write(fd, &[byte as u8]) != Some(1) {
            warn!("section overflow");
            return self.fail_load();
        }
        self.remaining -= 1;
        if self.remaining == 0 {
            self.memmgr().close(fd);
            self.open_fd = None;
        }
        Reply::ok(0)
    }

    fn load_end(&mut self) -> Reply {
        if self.load_state != LoadState::Data || self.remaining != 0 {
            return self.fail_load();
        }
        let Some(slot) = self.load_slot else {
            return self.fail_load();
        };
        let checked = self.memmgr().check_metadata(slot);
        match checked {
            Ok(()) => {
                self.load_state = LoadState::None;
                self.load_slot = None;
                self.open_fd = None;
                debug!(slot, "container loaded");
                Reply::ok(0)
            }
            Err(error) => {
                warn!(slot, %error, "metadata check failed");
                self.fail_load()
            }
        }
    }

    fn uid_fail(&mut self) -> Reply {
        self.uid = UidQuery::default();
        Reply::ko()
    }

    fn uid_len(&mut self, len: u32) -> Reply {
        if self.uid.state != UidState::Ready {
            return self.uid_fail();
        }
        let len = len as usize;
        if len == 0 || len > UID_MAX {
            return self.uid_fail();
        }
        self.uid.expect = len;
        self.uid.buf.clear();
        self.uid.state = UidState::Reading;
        Reply::ok(0)
    }

    fn uid_byte(&mut self, byte: u32) -> Reply {
        if self.uid.state != UidState::Reading {
            return self.uid_fail();
        }
        self.uid.buf.push(byte as u8);
        if self.uid.buf.len() == self.uid.expect {
            self.uid.state = UidState::Resolve;
        }
        Reply::ok(0)
    }

    fn get_slot_id(&mut self) -> Reply {
        if self.uid.state != UidState::Resolve {
            return self.uid_fail();
        }
        let slot = self.memmgr().uid_to_slot(&self.uid.buf);
        self.uid = UidQuery::default();
        match slot {
            Some(slot) => Reply::ok(slot as u32),
            None => Reply::ko(),
        }
    }

    /// Failure of a mailbox operation by the lock holder releases the lock.
    fn io_fail(&mut self, owner: Pid) -> Reply {
        if self.mailbox.held_by(owner) {
            self.mailbox.clear();
        }
        Reply::ko()
    }

    fn io_fd(&mut self, value: i32, owner: Pid) -> Reply {
        if let Some(holder) = self.mailbox.locked_by {
            if holder != owner {
                if self.mailbox.acquired.elapsed() >= Duration::from_millis(MAILBOX_LEASE_MS) {
                    warn!(holder = holder.0, "mailbox lease expired, reclaiming");
                    self.mailbox.clear();
                } else {
                    return Reply::retry();
                }
            }
        }
        self.mailbox.clear();
        self.mailbox.locked_by = Some(owner);
        self.mailbox.acquired = Instant::now();
        self.mailbox.fd = value;
        Reply::ok(0)
    }

    fn io_size(&mut self, value: u32, owner: Pid) -> Reply {
        if !self.mailbox.held_by(owner) {
            return Reply::ko();
        }
        self.mailbox.size = value as i32;
        Reply::ok(0)
    }

    fn io_buffer(&mut self, value: u8, owner: Pid) -> Reply {
        if !self.mailbox.held_by(owner) {
            return Reply::ko();
        }
        if self.mailbox.size >= IO_BUF as i32 {
            return self.io_fail(owner);
        }
        if self.mailbox.size < 0 {
            self.mailbox.size = 0;
        }
        self.mailbox.buffer[self.mailbox.size as usize] = value;
        self.mailbox.size += 1;
        Reply::ok(0)
    }

    fn io_open(&mut self, owner: Pid) -> Reply {
        if !self.mailbox.held_by(owner) || self.mailbox.fd < 0 {
            return self.io_fail(owner);
        }
        let opened = self.driver.open(self.mailbox.fd as u32);
        self.mailbox.clear();
        Reply::ok(opened as u32)
    }

    fn io_close(&mut self, owner: Pid) -> Reply {
        if !self.mailbox.held_by(owner) || self.mailbox.fd < 0 {
            return self.io_fail(owner);
        }
        self.driver.close(self.mailbox.fd);
        self.mailbox.clear();
        Reply::ok(0)
    }

    fn io_read(&mut self, index: i32, owner: Pid) -> Reply {
        if !self.mailbox.held_by(owner) || self.mailbox.fd < 0 {
            return self.io_fail(owner);
        }
        if index == -1 {
            // first phase: fill the mailbox from the driver
            let cap = self.mailbox.size.clamp(0, IO_BUF as i32) as usize;
            let count = self.driver.read(self.mailbox.fd, &mut self.mailbox.buffer[..cap]);
            if count < 0 {
                return self.io_fail(owner);
            }
            self.mailbox.size = count as i32;
            if count == 0 {
                self.mailbox.clear();
            }
            return Reply::ok(count as u32);
        }
        // second phase: hand the buffer back one byte at a time
        if index < 0 || index >= self.mailbox.size {
            return self.io_fail(owner);
        }
        let value = self.mailbox.buffer[index as usize];
        if index == self.mailbox.size - 1 {
            self.mailbox.clear();
        }
        Reply::ok(value as u32)
    }

    fn io_write(&mut self, owner: Pid) -> Reply {
        if !self.mailbox.held_by(owner) || self.mailbox.fd < 0 || self.mailbox.size < 0 {
            return self.io_fail(owner);
        }
        let size = self.mailbox.size as usize;
        let count = self.driver.write(self.mailbox.fd, &self.mailbox.buffer[..size]);
        self.mailbox.clear();
        if count < 0 {
            return Reply::ko();
        }
        Reply::ok(count as u32)
    }
}

enum Open {
    Meta,
    Code,
    Data,
}

/// Spawn the controller task; requests flow through the returned client.
pub(crate) fn spawn(
    rx: mpsc::UnboundedReceiver<Request>,
    memmgr: Arc<Mutex<MemoryManager>>,
    service: ServiceClient,
    driver: Box<dyn IoDriver>,
    priority: u8,
) -> Pid {
    let controller = Controller {
        memmgr,
        service,
        driver,
        load_state: LoadState::None,
        load_slot: None,
        open_fd: None,
        remaining: 0,
        uid: UidQuery::default(),
        mailbox: Mailbox::new(),
    };
    sthread::spawn(
        SpawnOptions {
            name: "controller",
            priority,
        },
        None,
        None,
        move |pid| controller.run(pid, rx),
    )
}

/// Typed client for the controller's request interface.
#[derive(Clone)]
pub struct ControllerClient {
    tx: mpsc::UnboundedSender<Request>,
}

enum SectionKind {
    Meta,
    Code,
    Data,
}

impl ControllerClient {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Request>) -> Self {
        Self { tx }
    }

    /// Issue one raw request and await its reply.
    pub async fn request(&self, build: impl FnOnce(oneshot::Sender<Reply>) -> Request) -> Reply {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(build(tx)).is_err() {
            return Reply::ko();
        }
        rx.await.unwrap_or_else(|_| Reply::ko())
    }

    async fn expect_ok(&self, build: impl FnOnce(oneshot::Sender<Reply>) -> Request) -> bool {
        self.request(build).await.status == Status::Ok
    }

    async fn send_section(&self, kind: SectionKind, bytes: &[u8]) -> bool {
        let size = bytes.len() as u32;
        let opened = match kind {
            SectionKind::Meta => {
                self.expect_ok(|reply| Request::MetaSize { size, reply }).await
            }
            SectionKind::Code => {
                self.expect_ok(|reply| Request::CodeSize { size, reply }).await
            }
            SectionKind::Data => {
                self.expect_ok(|reply| Request::DataSize { size, reply }).await
            }
        };
        if !opened {
            return false;
        }
        for &byte in bytes {
            let byte = byte as u32;
            let ok = match kind {
                SectionKind::Meta => self.expect_ok(|reply| Request::MetaByte { byte, reply }).await,
                SectionKind::Code => self.expect_ok(|reply| Request::CodeByte { byte, reply }).await,
                SectionKind::Data => self.expect_ok(|reply| Request::DataByte { byte, reply }).await,
            };
            if !ok {
                return false;
            }
        }
        true
    }

    /// Stream a complete image through the loading state machine.
    pub async fn load(&self, metadata: &[u8], data: &[u8], code: &[u8]) -> bool {
        if !self.expect_ok(|reply| Request::BeginLoad { reply }).await {
            return false;
        }
        if !self.send_section(SectionKind::Meta, metadata).await {
            return false;
        }
        if !self.send_section(SectionKind::Code, code).await {
            return false;
        }
        if !self.send_section(SectionKind::Data, data).await {
            return false;
        }
        self.expect_ok(|reply| Request::LoadEnd { reply }).await
    }

    pub async fn start(&self, slot: SlotId) -> bool {
        let slot = slot as u32;
        self.expect_ok(|reply| Request::Start { slot, reply }).await
    }

    pub async fn stop(&self, slot: SlotId) -> bool {
        let slot = slot as u32;
        self.expect_ok(|reply| Request::Stop { slot, reply }).await
    }

    pub async fn is_running(&self, slot: SlotId) -> bool {
        let slot = slot as u32;
        self.expect_ok(|reply| Request::IsRunning { slot, reply }).await
    }

    pub async fn delete(&self, slot: SlotId) -> bool {
        let slot = slot as u32;
        self.expect_ok(|reply| Request::Delete { slot, reply }).await
    }

    /// Resolve a container uid to its slot through the uid query protocol.
    pub async fn slot_for_uid(&self, uid: &[u8]) -> Option<SlotId> {
        let len = uid.len() as u32;
        if !self.expect_ok(|reply| Request::UidLen { len, reply }).await {
            return None;
        }
        for &byte in uid {
            let byte = byte as u32;
            if !self.expect_ok(|reply| Request::UidByte { byte, reply }).await {
                return None;
            }
        }
        let reply = self.request(|reply| Request::GetSlotId { reply }).await;
        (reply.status == Status::Ok).then_some(reply.value as SlotId)
    }

    /// Acquire the endpoint mailbox, yielding while another container
    /// holds it.
    async fn io_acquire(&self, value: i32, owner: Pid) -> bool {
        loop {
            let reply = self
                .request(|reply| Request::IoFd { value, owner, reply })
                .await;
            match reply.status {
                Status::Ok => return true,
                Status::Retry => yield_now().await,
                Status::Ko => return false,
            }
        }
    }

    pub(crate) async fn io_open(&self, peer_endpoint_id: u32, owner: Pid) -> i32 {
        if !self.io_acquire(peer_endpoint_id as i32, owner).await {
            return -1;
        }
        let reply = self.request(|reply| Request::IoOpen { owner, reply }).await;
        match reply.status {
            Status::Ok => reply.value as i32,
            _ => -1,
        }
    }

    pub(crate) async fn io_close_peer(&self, fd: i32, owner: Pid) {
        if self.io_acquire(fd, owner).await {
            let _ = self.request(|reply| Request::IoClose { owner, reply }).await;
        }
    }

    pub(crate) async fn io_read(&self, fd: i32, buf: &mut [u8], owner: Pid) -> isize {
        if !self.io_acquire(fd, owner).await {
            return -1;
        }
        let cap = buf.len().min(IO_BUF) as u32;
        if !self
            .expect_ok(|reply| Request::IoSize { value: cap, owner, reply })
            .await
        {
            return -1;
        }
        let reply = self
            .request(|reply| Request::IoRead { index: -1, owner, reply })
            .await;
        if reply.status != Status::Ok {
            return -1;
        }
        let count = reply.value as i32;
        if count < 0 || count as usize > buf.len() {
            return -1;
        }
        for index in 0..count {
            let reply = self
                .request(|reply| Request::IoRead { index, owner, reply })
                .await;
            if reply.status != Status::Ok {
                return -1;
            }
            buf[index as usize] = reply.value as u8;
        }
        count as isize
    }

    pub(crate) async fn io_write(&self, fd: i32, buf: &[u8], owner: Pid) -> isize {
        if !self.io_acquire(fd, owner).await {
            return -1;
        }
        let window = &buf[..buf.len().min(IO_BUF)];
        for &byte in window {
            if !self
                .expect_ok(|reply| Request::IoBuffer { value: byte, owner, reply })
                .await
            {
                return -1;
            }
        }
        let reply = self.request(|reply| Request::IoWrite { owner, reply }).await;
        match reply.status {
            Status::Ok => reply.value as i32 as isize,
            _ => -1,
        }
    }
}
