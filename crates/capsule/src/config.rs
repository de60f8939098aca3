//! Compile-time limits of the supervisor
//!
//! All tables are statically sized; exhausting one surfaces as an explicit
//! error, never an abort.

/// Number of container slots.
pub const MAX_SLOTS: usize = 3;

/// Number of simultaneously open endpoint file descriptors.
pub const MAX_FDS: usize = 10;

/// Maximum metadata envelope size per slot, in bytes.
pub const META_MAX: usize = 512;

/// Size of the shared code+data buffer per slot, in bytes. Code is placed
/// at offset zero; data follows at the next 4-byte boundary after sealing.
pub const CODE_DATA_MAX: usize = 1024;

/// Size of the shared-memory I/O window and the endpoint mailbox buffer.
pub const IO_BUF: usize = 256;

/// Live guest instances allowed per registered engine.
pub const MAX_HANDLES_PER_ENGINE: usize = 3;

/// Maximum container uid length, in bytes.
pub const UID_MAX: usize = capsule_seal::UID_MAX;

/// How long one holder may keep the endpoint mailbox locked before a
/// contending request may force-release it, in milliseconds.
pub const MAILBOX_LEASE_MS: u64 = 2_000;
