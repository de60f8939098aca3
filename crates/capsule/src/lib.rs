//! Capsule: a multi-tenant container supervisor for constrained devices
//!
//! Capsule loads, verifies and time-slices small guest applications on a
//! single device. Each container ships a signed metadata envelope, an
//! optional data blob and executable code for one of the registered guest
//! engines. The supervisor enforces the container's capability mask at
//! every syscall and brokers all I/O between guests and the host's
//! endpoint driver.
//!
//! ## Architecture
//!
//! Two actor tasks own all mutable state: the **controller** (lifecycle
//! and the loading state machine) and the **service** (per-container
//! workers, the fd table and the syscall broker). Container workers are
//! spawned through the sandbox harness in [`sthread`] and talk to the
//! supervisor exclusively through their shared-memory region.

pub mod config;
pub mod controller;
pub mod driver;
pub mod endpoint;
mod error;
pub mod memmgr;
pub mod runtime;
pub mod service;
pub mod shared;
pub mod sthread;

pub use capsule_seal as seal;
pub use capsule_seal::{Key, KeyStore};
pub use controller::{ControllerClient, Reply, Request, Status};
pub use driver::{IoDriver, NullDriver};
pub use error::{SupervisorError, SupervisorResult};
pub use runtime::{Natives, Runtime, RuntimeFactory, RuntimeRegistry};
pub use sthread::Pid;

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::memmgr::MemoryManager;
use crate::service::ServiceClient;

/// Builder for a supervisor instance.
pub struct SupervisorBuilder {
    driver: Box<dyn IoDriver>,
    keys: KeyStore,
    registry: Arc<RuntimeRegistry>,
    controller_priority: u8,
    service_priority: u8,
    container_priority: u8,
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self {
            driver: Box::new(NullDriver),
            keys: KeyStore::new(),
            registry: Arc::new(RuntimeRegistry::new()),
            controller_priority: 0,
            service_priority: 0,
            container_priority: 0,
        }
    }
}

impl SupervisorBuilder {
    /// The host's endpoint I/O driver.
    pub fn driver(mut self, driver: impl IoDriver + 'static) -> Self {
        self.driver = Box::new(driver);
        self
    }

    /// Install the device identity key (key slot 0), the verification key
    /// for every container token.
    pub fn device_key(mut self, key: Key) -> Self {
        // slot 0 always exists
        let _ = self.keys.install(seal::DEVICE_KEY_SLOT, key);
        self
    }

    /// Install a key into an arbitrary slot.
    pub fn key(mut self, slot: usize, key: Key) -> SupervisorResult<Self> {
        self.keys.install(slot, key)?;
        Ok(self)
    }

    /// Register a guest engine for a metadata runtime-type discriminant.
    pub fn engine(
        self,
        runtime_type: u8,
        factory: Arc<dyn RuntimeFactory>,
    ) -> SupervisorResult<Self> {
        self.registry.register(runtime_type, factory)?;
        Ok(self)
    }

    /// Advisory task priorities, in controller / service / container order.
    pub fn priorities(mut self, controller: u8, service: u8, container: u8) -> Self {
        self.controller_priority = controller;
        self.service_priority = service;
        self.container_priority = container;
        self
    }

    /// Spawn the supervisor tasks. Must be called from within an async
    /// runtime.
    pub fn init(self) -> Supervisor {
        let memmgr = Arc::new(Mutex::new(MemoryManager::new(self.keys)));

        let (controller_tx, controller_rx) = mpsc::unbounded_channel();
        let (service_tx, service_rx) = mpsc::unbounded_channel();
        let controller_client = ControllerClient::new(controller_tx);
        let service_client = ServiceClient {
            tx: service_tx.clone(),
        };

        service::spawn(
            service_tx,
            service_rx,
            memmgr.clone(),
            self.registry,
            controller_client.clone(),
            self.service_priority,
            self.container_priority,
        );
        let pid = controller::spawn(
            controller_rx,
            memmgr,
            service_client,
            self.driver,
            self.controller_priority,
        );

        Supervisor {
            controller: controller_client,
            pid,
        }
    }
}

/// Handle to a running supervisor.
pub struct Supervisor {
    controller: ControllerClient,
    pid: Pid,
}

impl Supervisor {
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::default()
    }

    /// The controller task's pid.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Protocol-level access to the controller's request interface.
    pub fn controller(&self) -> &ControllerClient {
        &self.controller
    }

    /// Load a container image. On any failure the slot is released and the
    /// tables are left as they were.
    pub async fn load(&self, metadata: &[u8], data: &[u8], code: &[u8]) -> bool {
        self.controller.load(metadata, data, code).await
    }

    /// Start the container with this uid.
    pub async fn start(&self, uid: &[u8]) -> bool {
        match self.controller.slot_for_uid(uid).await {
            Some(slot) => self.controller.start(slot).await,
            None => false,
        }
    }

    /// Request a cooperative stop; the guest winds down at its next loop
    /// boundary.
    pub async fn stop(&self, uid: &[u8]) -> bool {
        match self.controller.slot_for_uid(uid).await {
            Some(slot) => self.controller.stop(slot).await,
            None => false,
        }
    }

    pub async fn is_running(&self, uid: &[u8]) -> bool {
        match self.controller.slot_for_uid(uid).await {
            Some(slot) => self.controller.is_running(slot).await,
            None => false,
        }
    }

    /// Unload a stopped container: close its fds, free its slot, forget
    /// its uid.
    pub async fn delete(&self, uid: &[u8]) -> bool {
        match self.controller.slot_for_uid(uid).await {
            Some(slot) => self.controller.delete(slot).await,
            None => false,
        }
    }
}
