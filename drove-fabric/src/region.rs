//! The request region: a contiguous, remotely-writable shared-memory segment
//! holding slotted request records.
//!
//! The region is laid out as `num_workers x num_clients x window_size` fixed
//! width slots. A remote client owns the write side of each slot in the
//! columns it has been assigned; the worker owning a column has the only
//! local reader and is the only party that resets a slot. The last byte of
//! every slot is the opcode byte: writers publish it last, so a reader that
//! observes a nonzero opcode is guaranteed to see the rest of the slot.
//!
//! This is memory the fabric mutates from outside the process, so it is kept
//! as a byte region: no typed views, and the opcode byte is only touched
//! through atomic accessors.
use crate::mem::align_up_hugepage;
use color_eyre::eyre::{bail, ensure, Result};
use memmap2::MmapMut;
use std::{
    fs,
    path::PathBuf,
    sync::atomic::{AtomicU8, Ordering},
};

pub const CACHE_LINE_SIZE: usize = 64;

/// Where request region backing files live.
fn shm_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        std::env::temp_dir().join("drove")
    }
}

pub fn region_path(shm_key: u32) -> PathBuf {
    shm_dir().join(format!("drove-rr-{}.data", shm_key))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub num_workers: usize,
    pub num_clients: usize,
    pub window_size: usize,
    pub slot_size: usize,
}

impl RegionLayout {
    pub fn new(
        num_workers: usize,
        num_clients: usize,
        window_size: usize,
        slot_size: usize,
    ) -> Result<Self> {
        ensure!(
            num_workers >= 1 && num_clients >= 1 && window_size >= 1,
            "Region layout dimensions must all be nonzero"
        );
        // A client publishes a slot with a single remote write and the worker
        // reads it with plain loads behind one opcode check, so a slot must
        // fit a single cache line exactly.
        ensure!(
            slot_size == CACHE_LINE_SIZE,
            "Slot size {} must be exactly one cache line ({} bytes)",
            slot_size,
            CACHE_LINE_SIZE
        );
        Ok(RegionLayout {
            num_workers,
            num_clients,
            window_size,
            slot_size,
        })
    }

    #[inline]
    pub fn slot_index(&self, wn: usize, clt: usize, ws: usize) -> usize {
        (wn * self.num_clients * self.window_size) + (clt * self.window_size) + ws
    }

    #[inline]
    pub fn slot_offset(&self, wn: usize, clt: usize, ws: usize) -> usize {
        self.slot_index(wn, clt, ws) * self.slot_size
    }

    pub fn num_slots(&self) -> usize {
        self.num_workers * self.num_clients * self.window_size
    }

    /// Slots in one worker's column.
    pub fn column_slots(&self) -> usize {
        self.num_clients * self.window_size
    }

    /// Total mapped bytes, aligned up to the hugepage size.
    pub fn region_bytes(&self) -> usize {
        align_up_hugepage(self.num_slots() * self.slot_size)
    }
}

/// A single slot within a mapped request region.
///
/// Only the opcode byte (the slot's last byte) is shared with concurrent
/// writers; it transitions zero -> nonzero by a remote write and
/// nonzero -> zero by the owning worker.
pub struct SlotView {
    ptr: *mut u8,
    len: usize,
}

impl SlotView {
    #[inline]
    fn opcode_cell(&self) -> &AtomicU8 {
        // The opcode byte is only ever accessed through this cell.
        unsafe { &*(self.ptr.add(self.len - 1) as *const AtomicU8) }
    }

    /// Current opcode byte. Acquire pairs with the writer's release so a
    /// nonzero opcode guarantees the payload bytes below it are visible.
    #[inline]
    pub fn opcode(&self) -> u8 {
        self.opcode_cell().load(Ordering::Acquire)
    }

    /// Reset the slot to idle. Only the owning worker calls this.
    #[inline]
    pub fn clear_opcode(&self) {
        self.opcode_cell().store(0, Ordering::Release);
    }

    /// Copy the payload (everything below the opcode byte) out of the slot.
    /// Valid only after `opcode()` returned nonzero.
    #[inline]
    pub fn copy_payload_into(&self, dst: &mut [u8]) {
        debug_assert!(dst.len() >= self.len - 1);
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr, dst.as_mut_ptr(), self.len - 1);
        }
    }

    /// Write a full slot in ascending address order, publishing the opcode
    /// byte last. This is the receive side of a one-sided slot write and is
    /// only used by fabric implementations.
    #[inline]
    pub fn publish_bytes(&self, src: &[u8]) {
        debug_assert_eq!(src.len(), self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr, self.len - 1);
        }
        self.opcode_cell().store(src[self.len - 1], Ordering::Release);
    }
}

/// A mapping of the request region backing file.
///
/// Every party (master, worker, loopback endpoints) holds its own mapping of
/// the same file, mirroring how each process maps the same segment.
pub struct RequestRegion {
    mmap: MmapMut,
    layout: RegionLayout,
    path: PathBuf,
}

impl RequestRegion {
    /// Create the region, or open it if a correctly-sized one already exists.
    /// Existing contents are preserved so the region survives master restart
    /// as long as the shm key is stable.
    pub fn create_or_open(shm_key: u32, layout: RegionLayout) -> Result<Self> {
        let dir = shm_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = region_path(shm_key);
        let total = layout.region_bytes() as u64;

        if path.exists() {
            if let Ok(meta) = fs::metadata(&path) {
                if meta.len() == total {
                    return Self::map(path, layout);
                }
            }
            // Size mismatch: stale region from a different configuration.
            fs::remove_file(&path)?;
        }

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(total)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap.fill(0);
        tracing::info!(shm_key, bytes = total, path = ?path, "Created request region");
        Ok(RequestRegion { mmap, layout, path })
    }

    /// Open an existing region. Fails if the master has not created it.
    pub fn open(shm_key: u32, layout: RegionLayout) -> Result<Self> {
        let path = region_path(shm_key);
        if !path.exists() {
            bail!("Request region {:?} does not exist; master must run first", path);
        }
        let meta = fs::metadata(&path)?;
        ensure!(
            meta.len() == layout.region_bytes() as u64,
            "Request region {:?} has size {} but layout expects {}",
            path,
            meta.len(),
            layout.region_bytes()
        );
        Self::map(path, layout)
    }

    fn map(path: PathBuf, layout: RegionLayout) -> Result<Self> {
        let file = fs::OpenOptions::new().read(true).write(true).open(&path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(RequestRegion { mmap, layout, path })
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn slot(&mut self, wn: usize, clt: usize, ws: usize) -> SlotView {
        debug_assert!(wn < self.layout.num_workers);
        debug_assert!(clt < self.layout.num_clients);
        debug_assert!(ws < self.layout.window_size);
        let off = self.layout.slot_offset(wn, clt, ws);
        SlotView {
            ptr: unsafe { self.mmap.as_mut_ptr().add(off) },
            len: self.layout.slot_size,
        }
    }

    /// Slot at a raw byte offset, as addressed by a one-sided write.
    pub fn slot_at_offset(&mut self, offset: usize) -> Result<SlotView> {
        ensure!(
            offset % self.layout.slot_size == 0
                && offset + self.layout.slot_size <= self.layout.num_slots() * self.layout.slot_size,
            "Write offset {} is not a valid slot offset",
            offset
        );
        Ok(SlotView {
            ptr: unsafe { self.mmap.as_mut_ptr().add(offset) },
            len: self.layout.slot_size,
        })
    }

    /// Remove the backing file.
    pub fn unlink(&self) -> Result<()> {
        let _ = fs::remove_file(&self.path);
        Ok(())
    }
}
