//! Allocator
//!
//! Bump allocation with a free-list fallback, generation-tagged
//! capabilities, and a root pointer. All state lives in the region
//! itself (Genesis fields plus the free-list chain); the allocator
//! struct below is a thin façade with no memory of its own, mirroring
//! a heap region's alloc/free shape but replacing mark-sweep GC with
//! an explicit free list.

pub mod freelist;
pub mod generation;

use crate::config::{align_up, PAGE_SIZE};
use crate::error::{Result, SlsError};
use crate::layout::VOID_OFFSET;
use crate::region::Region;

/// A capability over an in-region allocation: an offset paired with the
/// `(alloc_id, generation)` that must still match the live generation
/// table for the pointer to be valid. Never persisted as a raw address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedPtr {
    pub offset: u64,
    pub alloc_id: u64,
    pub generation: u64,
}

impl TypedPtr {
    pub const VOID: TypedPtr = TypedPtr {
        offset: VOID_OFFSET,
        alloc_id: VOID_OFFSET,
        generation: VOID_OFFSET,
    };

    pub fn is_void(&self) -> bool {
        self.offset == VOID_OFFSET
    }
}

/// Allocator operations over an open `Region`.
pub struct Allocator<'a> {
    region: &'a mut Region,
    coalesce: bool,
}

impl<'a> Allocator<'a> {
    pub fn new(region: &'a mut Region, coalesce: bool) -> Self {
        Self { region, coalesce }
    }

    /// Round `n` up to a multiple of 8, and up to at least `NODE_SIZE`
    /// so every freeable block is large enough to hold a free-list node
    /// (`free` rounds the same way, so the two always agree on extent).
    fn round_align(n: u64) -> u64 {
        align_up(n.max(freelist::NODE_SIZE), 8)
    }

    /// Bump-then-free-list allocation of `n` bytes. `n == 0` returns
    /// `TypedPtr::VOID` by convention (well-defined empty allocation).
    /// Exhaustion also returns `TypedPtr::VOID` rather than an error,
    /// per the sentinel-return convention: callers detect absence via
    /// `is_void()`/`check_ptr` instead of matching on an error variant.
    pub fn alloc(&mut self, n: u64) -> Result<TypedPtr> {
        if n == 0 {
            return Ok(TypedPtr::VOID);
        }
        let size = Self::round_align(n);
        let offset = match self.bump_or_freelist(size)? {
            Some(offset) => offset,
            None => return Ok(TypedPtr::VOID),
        };
        let (alloc_id, generation) = self.assign_generation()?;
        self.region.add_total_allocated(size)?;
        Ok(TypedPtr {
            offset,
            alloc_id,
            generation,
        })
    }

    /// `alloc` followed by zero-fill.
    pub fn calloc(&mut self, n: u64) -> Result<TypedPtr> {
        let ptr = self.alloc(n)?;
        if ptr.is_void() {
            return Ok(ptr);
        }
        let size = Self::round_align(n);
        if let Some(slice) = self.region.offset_to_slice_mut(ptr.offset, size)? {
            slice.fill(0);
        }
        Ok(ptr)
    }

    /// Allocate `n` bytes rounded up to whole 4 KiB pages, at a
    /// page-aligned offset.
    pub fn alloc_pages(&mut self, n: u64) -> Result<TypedPtr> {
        if n == 0 {
            return Ok(TypedPtr::VOID);
        }
        let size = align_up(n, PAGE_SIZE);
        let offset = match self.bump_or_freelist_aligned(size, PAGE_SIZE)? {
            Some(offset) => offset,
            None => return Ok(TypedPtr::VOID),
        };
        let (alloc_id, generation) = self.assign_generation()?;
        self.region.add_total_allocated(size)?;
        Ok(TypedPtr {
            offset,
            alloc_id,
            generation,
        })
    }

    fn bump_or_freelist(&mut self, size: u64) -> Result<Option<u64>> {
        self.bump_or_freelist_aligned(size, 8)
    }

    /// Bump from `next_alloc_offset`, falling back to a first-fit
    /// free-list scan. Returns `None` on exhaustion of both paths.
    fn bump_or_freelist_aligned(&mut self, size: u64, align: u64) -> Result<Option<u64>> {
        let next = align_up(self.region.next_alloc_offset()?, align);
        let region_len = self.region.len();

        if next.checked_add(size).map(|e| e <= region_len).unwrap_or(false) {
            self.region.set_next_alloc_offset(next + size)?;
            return Ok(Some(next));
        }

        let head = self.region.free_list_head()?;
        if head == VOID_OFFSET {
            return Ok(None);
        }

        let buf = self.region.as_bytes_mut();
        match freelist::pop_first_fit(buf, head, size)? {
            Some((node_offset, _node_size, new_head)) => {
                self.region.set_free_list_head(new_head)?;
                Ok(Some(node_offset))
            }
            None => Ok(None),
        }
    }

    /// Return `(offset, size)` to the free list. `size` is rounded the
    /// same way `alloc` rounds its request, so it always matches the
    /// true extent of the block being freed regardless of whether the
    /// caller passes the original request or the rounded block size.
    pub fn free(&mut self, offset: u64, size: u64) -> Result<()> {
        if offset == VOID_OFFSET {
            return Ok(());
        }
        let size = Self::round_align(size);
        let region_len = self.region.len();
        if offset >= region_len || offset.checked_add(size).map(|e| e > region_len).unwrap_or(true)
        {
            // An invalid pointer to free must not corrupt the free
            // list. We record nothing and simply decline.
            return Err(SlsError::Invalid(format!(
                "free: offset {offset:#x} size {size} outside region"
            )));
        }

        let epoch = self.region.current_epoch()?;
        let head = self.region.free_list_head()?;
        let coalesce = self.coalesce;
        let buf = self.region.as_bytes_mut();
        let new_head = freelist::push(buf, head, offset, size, epoch, coalesce)?;
        self.region.set_free_list_head(new_head)?;
        self.region.add_total_freed(size)?;
        Ok(())
    }

    fn assign_generation(&mut self) -> Result<(u64, u64)> {
        let table_base = self.region.gen_table_offset()?;
        let buf = self.region.as_bytes_mut();
        generation::alloc_generation(buf, table_base)
    }

    pub fn revoke(&mut self, alloc_id: u64) -> Result<u64> {
        let table_base = self.region.gen_table_offset()?;
        let buf = self.region.as_bytes_mut();
        generation::revoke(buf, table_base, alloc_id)
    }

    pub fn check_generation(&self, alloc_id: u64, generation: u64) -> Result<crate::tri::Tri> {
        let table_base = self.region.gen_table_offset()?;
        generation::check_generation(self.region.as_bytes(), table_base, alloc_id, generation)
    }

    /// Validate that `ptr` still carries the live generation for its
    /// `alloc_id`, and that its offset lies inside the region.
    pub fn check_ptr(&self, ptr: &TypedPtr) -> Result<crate::tri::Tri> {
        if ptr.is_void() {
            return Ok(crate::tri::Tri::Void);
        }
        if ptr.offset >= self.region.len() {
            return Ok(crate::tri::Tri::False);
        }
        self.check_generation(ptr.alloc_id, ptr.generation)
    }

    /// Set the application root pointer. Refuses offsets outside the
    /// region.
    pub fn set_root(&mut self, offset: u64) -> Result<()> {
        if offset != VOID_OFFSET && offset >= self.region.len() {
            return Err(SlsError::Invalid(format!(
                "set_root: offset {offset:#x} outside region"
            )));
        }
        self.region.set_app_root(offset)
    }

    pub fn root(&self) -> Result<u64> {
        self.region.app_root()
    }

    /// Borrow the underlying region. Used by the snapshot engine's
    /// `cow_page` hook, which needs to read/allocate/write without
    /// going through a second `Allocator` of its own.
    pub fn region(&self) -> &Region {
        self.region
    }

    pub fn region_mut(&mut self) -> &mut Region {
        self.region
    }
}
