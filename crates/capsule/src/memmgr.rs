//! Slot table and byte-addressable storage for container images
//!
//! Each slot holds one metadata buffer and one shared code+data buffer.
//! Code is written first at offset zero; closing it seals the section and
//! fixes the data offset at the next 4-byte boundary. Data can only be
//! opened, written or read once code is sealed.

use capsule_seal as seal;
use capsule_seal::KeyStore;
use tracing::{debug, warn};

use crate::config::{CODE_DATA_MAX, MAX_SLOTS, META_MAX};
use crate::error::{SupervisorError, SupervisorResult};

pub type SlotId = usize;

/// Container image sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Data = 0,
    Code = 1,
    Meta = 2,
}

/// Section handle, encoded as `(slot + 1) * 10 + section`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionFd(i32);

impl SectionFd {
    pub fn new(slot: SlotId, section: Section) -> Self {
        SectionFd((slot as i32 + 1) * 10 + section as i32)
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        let fd = SectionFd(raw);
        fd.decode().map(|_| fd)
    }

    fn decode(self) -> Option<(SlotId, Section)> {
        let slot = self.0 / 10 - 1;
        if slot < 0 || slot as usize >= MAX_SLOTS {
            return None;
        }
        let section = match self.0 % 10 {
            0 => Section::Data,
            1 => Section::Code,
            2 => Section::Meta,
            _ => return None,
        };
        Some((slot as usize, section))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Descriptor {
    allocated: bool,
    provisioning: bool,
    ready: bool,
    meta_open: bool,
    code_open: bool,
    code_sealed: bool,
    data_open: bool,
    meta_pos: usize,
    code_pos: usize,
    data_pos: usize,
}

struct Image {
    meta_len: usize,
    code_len: usize,
    data_len: usize,
    meta: [u8; META_MAX],
    body: [u8; CODE_DATA_MAX],
}

impl Image {
    fn new() -> Self {
        Self {
            meta_len: 0,
            code_len: 0,
            data_len: 0,
            meta: [0; META_MAX],
            body: [0; CODE_DATA_MAX],
        }
    }

    fn code_len_rounded(&self) -> usize {
        (self.code_len + 3) & !3
    }
}

/// The slot table. Writer-side calls come from the controller during
/// loading; reader-side calls come from the service and the runtime
/// adapter once code is sealed.
pub struct MemoryManager {
    descriptors: [Descriptor; MAX_SLOTS],
    images: [Image; MAX_SLOTS],
    keys: KeyStore,
}

impl MemoryManager {
    pub fn new(keys: KeyStore) -> Self {
        Self {
            descriptors: [Descriptor::default(); MAX_SLOTS],
            images: std::array::from_fn(|_| Image::new()),
            keys,
        }
    }

    /// Allocate a fresh slot in PROVISIONING state.
    pub fn new_slot(&mut self) -> Option<SlotId> {
        for (slot, descriptor) in self.descriptors.iter_mut().enumerate() {
            if !descriptor.allocated {
                *descriptor = Descriptor {
                    allocated: true,
                    provisioning: true,
                    ..Descriptor::default()
                };
                return Some(slot);
            }
        }
        None
    }

    /// Release a slot and wipe its image.
    pub fn free(&mut self, slot: SlotId) {
        if slot < MAX_SLOTS {
            self.descriptors[slot] = Descriptor::default();
            self.images[slot] = Image::new();
        }
    }

    pub fn is_allocated(&self, slot: SlotId) -> bool {
        slot < MAX_SLOTS && self.descriptors[slot].allocated
    }

    /// True once the slot's metadata has been verified.
    pub fn is_ready(&self, slot: SlotId) -> bool {
        slot < MAX_SLOTS && self.descriptors[slot].ready
    }

    pub fn open_meta(&mut self, slot: SlotId) -> Option<SectionFd> {
        let descriptor = self.descriptors.get_mut(slot)?;
        if !descriptor.allocated {
            return None;
        }
        descriptor.meta_open = true;
        descriptor.meta_pos = 0;
        Some(SectionFd::new(slot, Section::Meta))
    }

    pub fn open_code(&mut self, slot: SlotId) -> Option<SectionFd> {
        let descriptor = self.descriptors.get_mut(slot)?;
        if !descriptor.allocated || descriptor.code_open {
            return None;
        }
        descriptor.code_open = true;
        descriptor.code_pos = 0;
        Some(SectionFd::new(slot, Section::Code))
    }

    pub fn open_data(&mut self, slot: SlotId) -> Option<SectionFd> {
        let descriptor = self.descriptors.get_mut(slot)?;
        if !descriptor.allocated || descriptor.data_open || !descriptor.code_sealed {
            return None;
        }
        descriptor.data_open = true;
        descriptor.data_pos = 0;
        Some(SectionFd::new(slot, Section::Data))
    }

    /// Close a section. Closing an opened code section seals it.
    pub fn close(&mut self, fd: SectionFd) {
        let Some((slot, section)) = fd.decode() else {
            return;
        };
        let descriptor = &mut self.descriptors[slot];
        if !descriptor.allocated {
            return;
        }
        match section {
            Section::Data => descriptor.data_open = false,
            Section::Code => {
                if descriptor.code_open {
                    descriptor.code_sealed = true;
                }
                descriptor.code_open = false;
            }
            Section::Meta => descriptor.meta_open = false,
        }
    }

    fn writable(descriptor: &Descriptor, section: Section) -> bool {
        match section {
            Section::Data => descriptor.data_open && descriptor.code_sealed,
            Section::Code => descriptor.code_open && !descriptor.code_sealed,
            Section::Meta => descriptor.meta_open,
        }
    }

    fn readable(descriptor: &Descriptor, section: Section) -> bool {
        match section {
            Section::Data => descriptor.data_open && descriptor.code_sealed,
            Section::Code => descriptor.code_open && descriptor.code_sealed,
            Section::Meta => descriptor.meta_open,
        }
    }

    /// Write at the section cursor. Writes past the section capacity are
    /// truncated; the caller must check the returned count.
    pub fn write(&mut self, fd: SectionFd, buf: &[u8]) -> Option<usize> {
        let (slot, section) = fd.decode()?;
        let descriptor = &mut self.descriptors[slot];
        if !descriptor.allocated || !Self::writable(descriptor, section) {
            return None;
        }
        let image = &mut self.images[slot];

        let (start, capacity, pos) = match section {
            Section::Meta => (0, META_MAX, &mut descriptor.meta_pos),
            Section::Code => (0, CODE_DATA_MAX, &mut descriptor.code_pos),
            Section::Data => {
                let offset = image.code_len_rounded();
                (offset, CODE_DATA_MAX - offset, &mut descriptor.data_pos)
            }
        };

        let count = buf.len().min(capacity - *pos);
        let target = match section {
            Section::Meta => &mut image.meta[start + *pos..start + *pos + count],
            _ => &mut image.body[start + *pos..start + *pos + count],
        };
        target.copy_from_slice(&buf[..count]);
        *pos += count;

        match section {
            Section::Meta => image.meta_len = *pos,
            Section::Code => image.code_len = *pos,
            Section::Data => image.data_len = *pos,
        }
        Some(count)
    }

    /// Read at the section cursor; data and code require a sealed code
    /// section.
    pub fn read(&mut self, fd: SectionFd, buf: &mut [u8]) -> Option<usize> {
        let (slot, section) = fd.decode()?;
        let descriptor = &mut self.descriptors[slot];
        if !descriptor.allocated || !Self::readable(descriptor, section) {
            return None;
        }
        let image = &self.images[slot];

        let (start, len, pos) = match section {
            Section::Meta => (0, image.meta_len, &mut descriptor.meta_pos),
            Section::Code => (0, image.code_len, &mut descriptor.code_pos),
            Section::Data => (image.code_len_rounded(), image.data_len, &mut descriptor.data_pos),
        };

        let count = buf.len().min(len - *pos);
        let source = match section {
            Section::Meta => &image.meta[start + *pos..start + *pos + count],
            _ => &image.body[start + *pos..start + *pos + count],
        };
        buf[..count].copy_from_slice(source);
        *pos += count;
        Some(count)
    }

    /// Current length of a section.
    pub fn size(&self, fd: SectionFd) -> Option<usize> {
        let (slot, section) = fd.decode()?;
        if !self.descriptors[slot].allocated {
            return None;
        }
        let image = &self.images[slot];
        Some(match section {
            Section::Data => image.data_len,
            Section::Code => image.code_len,
            Section::Meta => image.meta_len,
        })
    }

    fn meta_of(&self, slot: SlotId) -> Option<&[u8]> {
        if !self.is_allocated(slot) {
            return None;
        }
        let image = &self.images[slot];
        Some(&image.meta[..image.meta_len])
    }

    /// Copies of the three sections, for the runtime adapter. Requires a
    /// sealed code section.
    pub fn sections(&self, slot: SlotId) -> Option<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        if !self.is_allocated(slot) || !self.descriptors[slot].code_sealed {
            return None;
        }
        let image = &self.images[slot];
        let meta = image.meta[..image.meta_len].to_vec();
        let code = image.body[..image.code_len].to_vec();
        let data_start = image.code_len_rounded();
        let data = image.body[data_start..data_start + image.data_len].to_vec();
        Some((meta, code, data))
    }

    /// Resolve a container uid to its slot.
    pub fn uid_to_slot(&self, uid: &[u8]) -> Option<SlotId> {
        (0..MAX_SLOTS).find(|&slot| {
            self.descriptors[slot].ready
                && self
                    .meta_of(slot)
                    .and_then(|meta| seal::uid_of(meta).ok())
                    .is_some_and(|slot_uid| slot_uid == uid)
        })
    }

    /// Look up an endpoint record in a slot's metadata.
    pub fn endpoint(&self, slot: SlotId, endpoint_id: u32) -> Option<seal::Endpoint> {
        let meta = self.meta_of(slot)?;
        seal::endpoint_of(meta, endpoint_id).ok().flatten()
    }

    /// The verified syscall capability mask of a slot; zero (deny all) when
    /// the token is absent, unverifiable or malformed.
    pub fn syscall_mask(&self, slot: SlotId) -> u32 {
        let Some(meta) = self.meta_of(slot) else {
            return 0;
        };
        let Ok(key) = self.keys.device_key() else {
            return 0;
        };
        match seal::syscall_mask(meta, key) {
            Ok(mask) => mask,
            Err(error) => {
                warn!(slot, %error, "syscall mask unavailable");
                0
            }
        }
    }

    /// Scheduling budgets from a slot's metadata.
    pub fn timing(&self, slot: SlotId) -> Option<seal::Timing> {
        seal::timing_of(self.meta_of(slot)?).ok()
    }

    /// Engine discriminant from a slot's metadata.
    pub fn runtime_type(&self, slot: SlotId) -> Option<u8> {
        seal::runtime_type_of(self.meta_of(slot)?).ok()
    }

    /// Verify a freshly loaded image: parse the envelope and check all
    /// three authentication tokens. Side-effect free on failure; on success
    /// the slot leaves PROVISIONING for READY.
    pub fn check_metadata(&mut self, slot: SlotId) -> SupervisorResult<()> {
        if !self.is_allocated(slot) {
            return Err(SupervisorError::SlotNotAllocated(slot));
        }
        if !self.descriptors[slot].code_sealed {
            return Err(SupervisorError::NotSealed(slot));
        }

        let image = &self.images[slot];
        let meta = &image.meta[..image.meta_len];
        let code = &image.body[..image.code_len];
        let data_start = image.code_len_rounded();
        let data = &image.body[data_start..data_start + image.data_len];

        let key = self.keys.device_key()?;
        seal::verify_image(meta, data, code, key)?;

        let uid = seal::uid_of(meta)?;
        debug!(slot, uid = %hex::encode(&uid), "metadata verified");

        let descriptor = &mut self.descriptors[slot];
        descriptor.provisioning = false;
        descriptor.ready = true;
        Ok(())
    }
}
