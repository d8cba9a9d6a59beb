//! Weight storage.
//!
//! The checkpoint payload is reachable three ways: a read-only memory map,
//! caller-supplied bytes, or a byte-budgeted paged cache that faults tensor
//! regions in from the file on demand. All three sit behind one dispatch
//! point, [TensorStorage::window], which hands out [TensorWindow] views; the
//! rest of the engine never knows which mode is active.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::loader::{LoadError, TensorRegion};

/// A read-only view of one tensor region.
///
/// Windows keep their backing storage alive: a paged region may be evicted
/// while a window into it is still held, in which case the backing buffer is
/// only released once the last window drops.
#[derive(Clone)]
pub struct TensorWindow {
    owner: WindowOwner,
    start: usize,
    len: usize,
}

#[derive(Clone)]
enum WindowOwner {
    Mapped(Arc<Mmap>),
    Preloaded(Arc<[u8]>),
    // u32-backed so f32 casts are always aligned.
    Page(Arc<Vec<u32>>),
}

impl TensorWindow {
    /// The raw bytes of the region.
    pub fn bytes(&self) -> &[u8] {
        let all: &[u8] = match &self.owner {
            WindowOwner::Mapped(map) => map,
            WindowOwner::Preloaded(bytes) => bytes,
            WindowOwner::Page(page) => bytemuck::cast_slice(page),
        };
        &all[self.start..self.start + self.len]
    }

    /// The region as f32 values. The whole region must be f32 data.
    pub fn floats(&self) -> &[f32] {
        bytemuck::cast_slice(self.bytes())
    }

    /// Split a quantized region into its leading per-group f32 scales and the
    /// int8 payload that follows them.
    pub fn scales_and_quants(&self, groups: usize) -> (&[f32], &[i8]) {
        let bytes = self.bytes();
        let (scales, quants) = bytes.split_at(groups * 4);
        (bytemuck::cast_slice(scales), bytemuck::cast_slice(quants))
    }
}

/// One entry of the paged cache.
struct ResidentPage {
    data: Arc<Vec<u32>>,
    len: usize,
}

/// A byte-budgeted window over the checkpoint file.
///
/// Regions are keyed by tensor index and evicted least-recently-used when a
/// fault would exceed the budget. Eviction only forgets the cache's own
/// reference; windows handed out earlier stay valid.
pub(crate) struct PagedCache {
    file: RefCell<File>,
    budget: usize,
    resident: RefCell<HashMap<usize, ResidentPage>>,
    lru: RefCell<VecDeque<usize>>,
    used: Cell<usize>,
}

impl PagedCache {
    fn new(file: File, budget: usize) -> Self {
        Self {
            file: RefCell::new(file),
            budget,
            resident: RefCell::new(HashMap::new()),
            lru: RefCell::new(VecDeque::new()),
            used: Cell::new(0),
        }
    }

    fn window(&self, region: TensorRegion) -> Result<TensorWindow, LoadError> {
        if let Some(page) = self.resident.borrow().get(&region.index) {
            self.touch(region.index);
            return Ok(TensorWindow {
                owner: WindowOwner::Page(page.data.clone()),
                start: 0,
                len: region.len,
            });
        }

        // Make room, oldest first. The budget was validated against the
        // largest region at construction, so this always terminates with
        // enough space.
        while self.used.get() + region.len > self.budget {
            let oldest = match self.lru.borrow_mut().pop_front() {
                Some(index) => index,
                None => break,
            };
            if let Some(page) = self.resident.borrow_mut().remove(&oldest) {
                self.used.set(self.used.get() - page.len);
                log::trace!("evicted tensor region {oldest} ({} bytes)", page.len);
            }
        }

        let mut words = vec![0u32; (region.len + 3) / 4];
        {
            let mut file = self.file.borrow_mut();
            file.seek(SeekFrom::Start(region.offset))?;
            file.read_exact(&mut bytemuck::cast_slice_mut(&mut words)[..region.len])?;
        }
        let data = Arc::new(words);

        self.resident.borrow_mut().insert(
            region.index,
            ResidentPage {
                data: data.clone(),
                len: region.len,
            },
        );
        self.lru.borrow_mut().push_back(region.index);
        self.used.set(self.used.get() + region.len);

        Ok(TensorWindow {
            owner: WindowOwner::Page(data),
            start: 0,
            len: region.len,
        })
    }

    /// Move a resident region to the most-recently-used position.
    fn touch(&self, index: usize) {
        let mut lru = self.lru.borrow_mut();
        if let Some(at) = lru.iter().position(|&i| i == index) {
            lru.remove(at);
            lru.push_back(index);
        }
    }
}

/// The three substitutable access modes, behind one `window` dispatch.
pub(crate) enum TensorStorage {
    Mapped(Arc<Mmap>),
    Preloaded(Arc<[u8]>),
    Paged(PagedCache),
}

impl TensorStorage {
    /// Map the checkpoint file read-only.
    pub fn map(path: &Path) -> Result<(Self, u64), LoadError> {
        let file = open(path)?;
        let map = unsafe { Mmap::map(&file) }?;
        let len = map.len() as u64;
        Ok((TensorStorage::Mapped(Arc::new(map)), len))
    }

    /// Treat caller-owned bytes as the checkpoint. The bytes are never
    /// copied or freed; tensor views require them to be 4-byte aligned.
    pub fn preload(bytes: Arc<[u8]>) -> Result<(Self, u64), LoadError> {
        if bytes.as_ptr() as usize % 4 != 0 {
            return Err(LoadError::UnalignedModelBytes);
        }
        let len = bytes.len() as u64;
        Ok((TensorStorage::Preloaded(bytes), len))
    }

    /// Open the checkpoint for paged access under `budget` bytes.
    ///
    /// `largest_region` comes from the tensor catalog; a budget that cannot
    /// hold it could never serve a forward pass.
    pub fn paged(path: &Path, budget: usize, largest_region: usize) -> Result<(Self, u64), LoadError> {
        if budget == 0 {
            return Err(LoadError::ZeroCacheBudget);
        }
        if budget < largest_region {
            return Err(LoadError::CacheTooSmall {
                budget,
                required: largest_region,
            });
        }
        let mut file = open(path)?;
        let len = file.seek(SeekFrom::End(0))?;
        Ok((TensorStorage::Paged(PagedCache::new(file, budget)), len))
    }

    /// Produce a read-only window over one tensor region.
    pub fn window(&self, region: TensorRegion) -> Result<TensorWindow, LoadError> {
        match self {
            TensorStorage::Mapped(map) => Ok(TensorWindow {
                owner: WindowOwner::Mapped(map.clone()),
                start: region.offset as usize,
                len: region.len,
            }),
            TensorStorage::Preloaded(bytes) => Ok(TensorWindow {
                owner: WindowOwner::Preloaded(bytes.clone()),
                start: region.offset as usize,
                len: region.len,
            }),
            TensorStorage::Paged(cache) => cache.window(region),
        }
    }

    /// Human-readable label for `describe()` output.
    pub fn mode_label(&self) -> &'static str {
        match self {
            TensorStorage::Mapped(_) => "mmap",
            TensorStorage::Preloaded(_) => "preloaded",
            TensorStorage::Paged(_) => "paged",
        }
    }
}

fn open(path: &Path) -> Result<File, LoadError> {
    File::open(path).map_err(|source| LoadError::OpenFile {
        source,
        path: path.to_owned(),
    })
}
