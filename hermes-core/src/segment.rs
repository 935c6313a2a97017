//! The backplane segment (§4.1): a named, fixed-layout shared-memory region
//! holding a header, a signal directory, a string table and a contiguous
//! value region.
//!
//! Layout, offset 0 upward:
//!
//! ```text
//! [ Header: 64 bytes ]
//! [ Directory: N * 12 bytes ]
//! [ String table: N null-terminated names ]
//! [ padding to 64-byte alignment ]
//! [ Value region: N * 8-byte slots ]
//! ```
//!
//! Every slot reserves a full 8-byte, naturally-aligned stride regardless of
//! its declared type, so that `get`/`set` are always a single atomic 8-byte
//! load/store (§4.1 access contract). Type-exact access via [SignalValue] is
//! the preferred public surface; `get_f64`/`set_f64` widen/narrow for callers
//! that only deal in doubles. This is the explicit type policy called for by
//! §9 Open Question (b): every slot is *stored* at its declared width inside
//! the 8-byte stride, but the only conversions offered beyond type-exact
//! access are to/from `f64`.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;
use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::error::{HermesErrorKind, HermesResult, ResultExt};
use crate::registry::{DataType, ResolvedSignal, SignalFlags};

pub const MAGIC: u32 = 0x4845_524D; // "HERM" little-endian
pub const VERSION: u32 = 3;

const HEADER_SIZE: usize = 64;
const DIR_ENTRY_SIZE: usize = 12;
const SLOT_STRIDE: usize = 8;
const VALUE_REGION_ALIGN: usize = 64;

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[repr(C)]
struct RawHeader {
    magic: u32,
    version: u32,
    frame: u64,
    time_ns: u64,
    signal_count: u32,
    reserved: [u8; 36],
}

const _: () = assert!(std::mem::size_of::<RawHeader>() == HEADER_SIZE);

/// A fully resolved directory entry, as discovered from the segment or as
/// computed at build time.
#[derive(Debug, Clone)]
struct SlotInfo {
    qualified_name: String,
    data_type: DataType,
    flags: SignalFlags,
    data_offset: usize,
}

/// The live directory dump of a segment: the ordered `(name, type, flags,
/// slot_offset)` tuples, used by `list-signals` and by the round-trip test
/// in §8.2.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub name: String,
    pub data_type: DataType,
    pub flags: SignalFlags,
    pub slot_offset: usize,
}

/// A type-exact signal value (§9 Open Question (b)).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalValue {
    F64(f64),
    F32(f32),
    I64(i64),
    I32(i32),
    Bool(bool),
}

impl SignalValue {
    pub fn data_type(&self) -> DataType {
        match self {
            SignalValue::F64(_) => DataType::F64,
            SignalValue::F32(_) => DataType::F32,
            SignalValue::I64(_) => DataType::I64,
            SignalValue::I32(_) => DataType::I32,
            SignalValue::Bool(_) => DataType::Bool,
        }
    }

    /// Widens this value to `f64`, regardless of its declared type.
    pub fn as_f64(&self) -> f64 {
        match *self {
            SignalValue::F64(v) => v,
            SignalValue::F32(v) => v as f64,
            SignalValue::I64(v) => v as f64,
            SignalValue::I32(v) => v as f64,
            SignalValue::Bool(v) => v as u8 as f64,
        }
    }

    fn to_bits(self) -> u64 {
        match self {
            SignalValue::F64(v) => v.to_bits(),
            SignalValue::F32(v) => v.to_bits() as u64,
            SignalValue::I64(v) => v as u64,
            SignalValue::I32(v) => v as u32 as u64,
            SignalValue::Bool(v) => v as u64,
        }
    }

    fn from_bits(data_type: DataType, bits: u64) -> Self {
        match data_type {
            DataType::F64 => SignalValue::F64(f64::from_bits(bits)),
            DataType::F32 => SignalValue::F32(f32::from_bits(bits as u32)),
            DataType::I64 => SignalValue::I64(bits as i64),
            DataType::I32 => SignalValue::I32(bits as u32 as i32),
            DataType::Bool => SignalValue::Bool((bits as u8) != 0),
        }
    }

    /// Narrows an `f64` into `data_type`, truncating/rounding as Rust's `as`
    /// casts do. Used by `set_f64` and by the wire router, which only ever
    /// deals in `f64` on the wire side regardless of a destination's
    /// declared type.
    pub(crate) fn from_f64(data_type: DataType, value: f64) -> Self {
        match data_type {
            DataType::F64 => SignalValue::F64(value),
            DataType::F32 => SignalValue::F32(value as f32),
            DataType::I64 => SignalValue::I64(value as i64),
            DataType::I32 => SignalValue::I32(value as i32),
            DataType::Bool => SignalValue::Bool(value != 0.0),
        }
    }
}

/// A handle onto a [BackplaneSegment]'s shared memory, either as the
/// constructing coordinator or as an attached reader/writer.
pub struct BackplaneSegment {
    shmem: Option<Shmem>,
    name: String,
    slots: Vec<SlotInfo>,
    name_to_slot: HashMap<String, usize>,
    is_coordinator: bool,
}

// Shmem's raw pointer is not Send/Sync by default in some crate versions;
// the segment itself only ever touches the mapping through atomics, which
// are safe to share across threads and processes.
unsafe impl Send for BackplaneSegment {}
unsafe impl Sync for BackplaneSegment {}

impl BackplaneSegment {
    fn layout(signals: &[ResolvedSignal]) -> (usize, usize, usize) {
        let dir_size = signals.len() * DIR_ENTRY_SIZE;
        let strtab_size: usize = signals
            .iter()
            .map(|s| s.qualified_name.len() + 1)
            .sum();
        let value_region_start =
            align_up(HEADER_SIZE + dir_size + strtab_size, VALUE_REGION_ALIGN);
        let total = value_region_start + signals.len() * SLOT_STRIDE;
        (dir_size, value_region_start, total)
    }

    /// Constructs a new named segment (§4.1 Construction contract). Fails
    /// with [HermesErrorKind::SharedMemory] if a segment of this name exists
    /// and was not cleanly unlinked.
    pub fn create(name: &str, signals: &[ResolvedSignal]) -> HermesResult<Self> {
        let (dir_size, value_region_start, total) = Self::layout(signals);

        let shmem = ShmemConf::new()
            .size(total)
            .os_id(name)
            .create()
            .map_err(|e| match e {
                ShmemError::MappingIdExists => {
                    anyhow!("backplane segment {name:?} already exists")
                }
                other => anyhow!(other),
            })
            .typ(HermesErrorKind::SharedMemory)?;

        let base = shmem.as_ptr();

        // Header: write magic/version last-of-fixed-fields so a half-written
        // segment from a crash can never look valid (magic at offset 0 is
        // the only field attach relies on first).
        unsafe {
            let header = base as *mut RawHeader;
            (*header).frame = 0;
            (*header).time_ns = 0;
            (*header).signal_count = signals.len() as u32;
            (*header).reserved = [0u8; 36];
            (*header).version = VERSION;
            (*header).magic = MAGIC;
        }

        // Directory + string table.
        let mut str_cursor = HEADER_SIZE + dir_size;
        let mut slots = Vec::with_capacity(signals.len());
        for (i, signal) in signals.iter().enumerate() {
            let name_offset = (str_cursor - (HEADER_SIZE + dir_size)) as u32;
            let data_offset = (value_region_start + i * SLOT_STRIDE) as u32;

            unsafe {
                let entry = base.add(HEADER_SIZE + i * DIR_ENTRY_SIZE) as *mut DirEntryRaw;
                (*entry).name_offset = name_offset;
                (*entry).data_offset = data_offset;
                (*entry).data_type = signal.data_type.tag();
                (*entry).flags = encode_flags(signal.flags);
                (*entry).pad = 0;

                let name_bytes = signal.qualified_name.as_bytes();
                std::ptr::copy_nonoverlapping(
                    name_bytes.as_ptr(),
                    base.add(str_cursor),
                    name_bytes.len(),
                );
                *base.add(str_cursor + name_bytes.len()) = 0;
            }
            str_cursor += signal.qualified_name.len() + 1;

            slots.push(SlotInfo {
                qualified_name: signal.qualified_name.clone(),
                data_type: signal.data_type,
                flags: signal.flags,
                data_offset: data_offset as usize,
            });
        }

        // Zero the value region.
        unsafe {
            std::ptr::write_bytes(base.add(value_region_start), 0, signals.len() * SLOT_STRIDE);
        }

        let name_to_slot = slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.qualified_name.clone(), i))
            .collect();

        Ok(Self {
            shmem: Some(shmem),
            name: name.to_string(),
            slots,
            name_to_slot,
            is_coordinator: true,
        })
    }

    /// Attaches an existing segment read/write (§4.1 Attach contract). Never
    /// writes to the header or directory after attach.
    pub fn attach(name: &str) -> HermesResult<Self> {
        let shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| anyhow!(e))
            .typ(HermesErrorKind::SharedMemory)?;

        let base = shmem.as_ptr();
        let header = unsafe { &*(base as *const RawHeader) };

        if header.magic != MAGIC {
            return Err(anyhow!(
                "segment {name:?} has wrong magic: {:#x}",
                header.magic
            ))
            .typ(HermesErrorKind::SharedMemory);
        }
        if header.version != VERSION {
            return Err(anyhow!(
                "segment {name:?} has wrong version: {} (expected {VERSION})",
                header.version
            ))
            .typ(HermesErrorKind::SharedMemory);
        }

        let signal_count = header.signal_count as usize;
        let dir_size = signal_count * DIR_ENTRY_SIZE;
        let strtab_start = HEADER_SIZE + dir_size;

        let mut slots = Vec::with_capacity(signal_count);
        for i in 0..signal_count {
            let entry = unsafe { &*(base.add(HEADER_SIZE + i * DIR_ENTRY_SIZE) as *const DirEntryRaw) };
            let name_ptr = unsafe { base.add(strtab_start + entry.name_offset as usize) };
            let qualified_name = unsafe { read_cstr(name_ptr) }
                .map_err(anyhow::Error::msg)
                .typ(HermesErrorKind::SharedMemory)?;

            slots.push(SlotInfo {
                qualified_name,
                data_type: DataType::from_tag(entry.data_type)?,
                flags: decode_flags(entry.flags),
                data_offset: entry.data_offset as usize,
            });
        }

        let name_to_slot = slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.qualified_name.clone(), i))
            .collect();

        Ok(Self {
            shmem: Some(shmem),
            name: name.to_string(),
            slots,
            name_to_slot,
            is_coordinator: false,
        })
    }

    fn base(&self) -> *mut u8 {
        self.shmem.as_ref().expect("segment already destroyed").as_ptr()
    }

    fn header(&self) -> &RawHeader {
        unsafe { &*(self.base() as *const RawHeader) }
    }

    fn slot_atomic(&self, slot: usize) -> &AtomicU64 {
        let offset = self.slots[slot].data_offset;
        unsafe { &*(self.base().add(offset) as *const AtomicU64) }
    }

    fn resolve(&self, name: &str) -> HermesResult<usize> {
        self.name_to_slot
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("unknown signal {name:?}"))
            .typ(HermesErrorKind::UnknownSignal)
    }

    /// Number of signals in this segment (`signal_count`, fixed at build time).
    pub fn signal_count(&self) -> usize {
        self.slots.len()
    }

    /// Dumps the segment directory in slot order (§8.2 round-trip property).
    pub fn directory(&self) -> Vec<DirectoryEntry> {
        self.slots
            .iter()
            .map(|s| DirectoryEntry {
                name: s.qualified_name.clone(),
                data_type: s.data_type,
                flags: s.flags,
                slot_offset: s.data_offset,
            })
            .collect()
    }

    /// Type-exact read of a signal's current value.
    pub fn get_value(&self, name: &str) -> HermesResult<SignalValue> {
        let slot = self.resolve(name)?;
        let bits = self.slot_atomic(slot).load(Ordering::Relaxed);
        Ok(SignalValue::from_bits(self.slots[slot].data_type, bits))
    }

    /// Type-exact write of a signal's value. Fails with
    /// [HermesErrorKind::NotWritable] if the signal lacks the WRITABLE flag.
    pub fn set_value(&self, name: &str, value: SignalValue) -> HermesResult<()> {
        let slot = self.resolve(name)?;
        if !self.slots[slot].flags.writable {
            return Err(anyhow!("signal {name:?} is not writable")).typ(HermesErrorKind::NotWritable);
        }
        if value.data_type() != self.slots[slot].data_type {
            return Err(anyhow!(
                "signal {name:?} is {:?}, got {:?}",
                self.slots[slot].data_type,
                value.data_type()
            ))
            .typ(HermesErrorKind::WrongType);
        }
        self.slot_atomic(slot).store(value.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Writes a value into a slot without checking the WRITABLE flag or the
    /// value's declared type against the slot's. Used by the wire router and
    /// by a module writing its own declared-writable signals where the
    /// caller has already established the type matches.
    pub(crate) fn set_value_unchecked(&self, slot: usize, value: SignalValue) {
        self.slot_atomic(slot).store(value.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn get_value_by_slot(&self, slot: usize) -> SignalValue {
        let bits = self.slot_atomic(slot).load(Ordering::Relaxed);
        SignalValue::from_bits(self.slots[slot].data_type, bits)
    }

    pub(crate) fn slot_of(&self, name: &str) -> HermesResult<usize> {
        self.resolve(name)
    }

    pub(crate) fn is_writable(&self, slot: usize) -> bool {
        self.slots[slot].flags.writable
    }

    /// Reads a signal, widening to `f64` (§4.1: "widen to f64 on read when
    /// asked for f64; type-exact access is preferred").
    pub fn get_f64(&self, name: &str) -> HermesResult<f64> {
        Ok(self.get_value(name)?.as_f64())
    }

    /// Writes a signal from `f64`, narrowing into the slot's declared type.
    pub fn set_f64(&self, name: &str, value: f64) -> HermesResult<()> {
        let slot = self.resolve(name)?;
        if !self.slots[slot].flags.writable {
            return Err(anyhow!("signal {name:?} is not writable")).typ(HermesErrorKind::NotWritable);
        }
        let narrowed = SignalValue::from_f64(self.slots[slot].data_type, value);
        self.slot_atomic(slot).store(narrowed.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Current frame counter. Non-coordinator attachments must only read this
    /// after `wait_step` returns (§4.1 access contract).
    pub fn get_frame(&self) -> u64 {
        unsafe { &*(&self.header().frame as *const u64 as *const AtomicU64) }.load(Ordering::Relaxed)
    }

    /// Current simulation time in nanoseconds. Same read-after-`wait_step`
    /// rule as [Self::get_frame] applies.
    pub fn get_time_ns(&self) -> u64 {
        unsafe { &*(&self.header().time_ns as *const u64 as *const AtomicU64) }.load(Ordering::Relaxed)
    }

    /// Writes the frame counter. Coordinator-only: §4.1 states only the
    /// coordinator writes this field, and it must happen before the `step`
    /// semaphore is released for the frame.
    pub fn set_frame(&self, frame: u64) -> HermesResult<()> {
        self.require_coordinator()?;
        unsafe { &*(&self.header().frame as *const u64 as *const AtomicU64) }
            .store(frame, Ordering::Relaxed);
        Ok(())
    }

    /// Writes the simulation time in nanoseconds. Coordinator-only, see
    /// [Self::set_frame].
    pub fn set_time_ns(&self, time_ns: u64) -> HermesResult<()> {
        self.require_coordinator()?;
        unsafe { &*(&self.header().time_ns as *const u64 as *const AtomicU64) }
            .store(time_ns, Ordering::Relaxed);
        Ok(())
    }

    fn require_coordinator(&self) -> HermesResult<()> {
        if !self.is_coordinator {
            return Err(anyhow!("only the constructing coordinator may write the header"))
                .typ(HermesErrorKind::Panic);
        }
        Ok(())
    }

    /// Unmaps and unlinks the segment. Idempotent: a second call is a no-op.
    /// Only the constructing coordinator should ever call this: an attached
    /// module must only detach (dropping the handle, which never unlinks).
    pub fn destroy(&mut self) {
        if let Some(shmem) = self.shmem.take() {
            drop(shmem);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for BackplaneSegment {
    fn drop(&mut self) {
        if self.is_coordinator {
            self.destroy();
        }
    }
}

#[repr(C)]
struct DirEntryRaw {
    name_offset: u32,
    data_offset: u32,
    data_type: u8,
    flags: u8,
    pad: u16,
}

const _: () = assert!(std::mem::size_of::<DirEntryRaw>() == DIR_ENTRY_SIZE);

fn encode_flags(flags: SignalFlags) -> u8 {
    (flags.writable as u8) | ((flags.published as u8) << 1)
}

fn decode_flags(bits: u8) -> SignalFlags {
    SignalFlags {
        writable: bits & 0b01 != 0,
        published: bits & 0b10 != 0,
    }
}

/// # Safety
/// `ptr` must point at a NUL-terminated, valid-UTF-8 byte sequence that stays
/// alive for the duration of the call.
unsafe fn read_cstr(ptr: *const u8) -> Result<String, String> {
    let mut len = 0usize;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    let slice = std::slice::from_raw_parts(ptr, len);
    std::str::from_utf8(slice)
        .map(|s| s.to_string())
        .map_err(|e| format!("invalid UTF-8 in string table: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{build_registry, SignalDescriptor};

    fn signals() -> Vec<ResolvedSignal> {
        let a_x = SignalDescriptor {
            name: "x".into(),
            data_type: DataType::F64,
            unit: None,
            description: None,
            writable: true,
            published: true,
        };
        let a_y = SignalDescriptor {
            name: "y".into(),
            data_type: DataType::F64,
            unit: None,
            description: None,
            writable: true,
            published: true,
        };
        let b_z = SignalDescriptor {
            name: "z".into(),
            data_type: DataType::F64,
            unit: None,
            description: None,
            writable: false,
            published: true,
        };
        build_registry([("a", &a_x), ("a", &a_y), ("b", &b_z)]).unwrap()
    }

    fn unique_name(test: &str) -> String {
        format!(
            "/hermes-test-{test}-{}",
            std::process::id()
        )
    }

    #[test]
    fn s1_round_trip_build() {
        let name = unique_name("s1");
        let signals = signals();
        let mut seg = BackplaneSegment::create(&name, &signals).unwrap();

        assert_eq!(seg.signal_count(), 3);
        let dir = seg.directory();
        assert_eq!(dir[0].name, "a.x");
        assert_eq!(dir[1].name, "a.y");
        assert_eq!(dir[2].name, "b.z");

        // Offsets 0, 8, 16 *within the value region*.
        let base_offset = dir[0].slot_offset;
        assert_eq!(dir[1].slot_offset - base_offset, 8);
        assert_eq!(dir[2].slot_offset - base_offset, 16);

        seg.destroy();
    }

    #[test]
    fn get_set_round_trips_and_rejects_unknown() {
        let name = unique_name("getset");
        let signals = signals();
        let mut seg = BackplaneSegment::create(&name, &signals).unwrap();

        seg.set_value("a.x", SignalValue::F64(42.0)).unwrap();
        assert_eq!(seg.get_f64("a.x").unwrap(), 42.0);

        let err = seg.set_value("nope", SignalValue::F64(1.0)).unwrap_err();
        assert_eq!(err.kind(), HermesErrorKind::UnknownSignal);

        let err = seg.set_value("b.z", SignalValue::F64(1.0)).unwrap_err();
        assert_eq!(err.kind(), HermesErrorKind::NotWritable);

        seg.destroy();
    }

    #[test]
    fn destroy_is_idempotent() {
        let name = unique_name("destroy");
        let signals = signals();
        let mut seg = BackplaneSegment::create(&name, &signals).unwrap();
        seg.destroy();
        seg.destroy();
    }

    #[test]
    fn attach_sees_coordinator_writes() {
        let name = unique_name("attach");
        let signals = signals();
        let mut seg = BackplaneSegment::create(&name, &signals).unwrap();
        seg.set_frame(7).unwrap();
        seg.set_time_ns(123).unwrap();
        seg.set_value("a.x", SignalValue::F64(3.5)).unwrap();

        let attached = BackplaneSegment::attach(&name).unwrap();
        assert_eq!(attached.get_frame(), 7);
        assert_eq!(attached.get_time_ns(), 123);
        assert_eq!(attached.get_f64("a.x").unwrap(), 3.5);

        drop(attached);
        seg.destroy();
    }
}
