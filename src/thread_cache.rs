//! Thread Cache (front-end): per-thread free lists for lock-free allocation.
//!
//! Each thread owns one `ThreadCache` (via `thread_local!`, or `#[thread_local]`
//! on nightly — see `allocator.rs`). The fast path, a hit in the per-class
//! free list, needs no synchronization at all. On a miss or overflow, a
//! batch of objects moves to/from the central cache.
//!
//! Batch sizing is a single `adaptive_batch[cls]` counter per class, grown
//! by one on a full-batch fetch: no cross-thread budget pool, no
//! low-water-mark scavenging thread, no overage-triggered shrink-back. Per-
//! class residency still stays bounded by `num_move_size(cls) *
//! roundup(cls)` bytes.

use crate::central_free_list::CentralCache;
use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::span::FreeObject;
use crate::stat_inc;
use crate::sync::SpinMutex;
use core::ptr;

/// Per-size-class free list within the thread cache.
struct FreeList {
    head: *mut FreeObject,
    length: u32,
    /// Current batch size for this class; grows by slow start up to
    /// `num_move_size(cls)`.
    adaptive_batch: u32,
}

impl FreeList {
    const fn new() -> Self {
        Self { head: ptr::null_mut(), length: 0, adaptive_batch: 1 }
    }

    #[inline]
    fn pop(&mut self) -> *mut FreeObject {
        let obj = self.head;
        if !obj.is_null() {
            self.head = unsafe { (*obj).next };
            self.length -= 1;
        }
        obj
    }

    #[inline]
    fn push(&mut self, obj: *mut FreeObject) {
        unsafe { (*obj).next = self.head };
        self.head = obj;
        self.length += 1;
    }

    fn push_batch(&mut self, head: *mut FreeObject, count: u32) {
        if head.is_null() || count == 0 {
            return;
        }
        let mut tail = head;
        for _ in 1..count {
            let next = unsafe { (*tail).next };
            if next.is_null() {
                break;
            }
            tail = next;
        }
        unsafe { (*tail).next = self.head };
        self.head = head;
        self.length += count;
    }

    /// Pop up to `count` objects into a (head, tail) linked list.
    fn pop_batch(&mut self, count: u32) -> (u32, *mut FreeObject, *mut FreeObject) {
        let mut head: *mut FreeObject = ptr::null_mut();
        let mut tail: *mut FreeObject = ptr::null_mut();
        let mut popped = 0u32;
        while popped < count && !self.head.is_null() {
            let obj = self.head;
            self.head = unsafe { (*obj).next };
            unsafe { (*obj).next = head };
            if tail.is_null() {
                tail = obj;
            }
            head = obj;
            self.length -= 1;
            popped += 1;
        }
        (popped, head, tail)
    }
}

/// Per-thread cache holding a free list per size class.
pub struct ThreadCache {
    lists: [FreeList; NUM_SIZE_CLASSES],
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadCache {
    pub const fn new() -> Self {
        Self { lists: [const { FreeList::new() }; NUM_SIZE_CLASSES] }
    }

    /// Flush every cached object back to the central cache. Called on
    /// thread exit.
    ///
    /// # Safety
    /// Must only be called once per thread cache lifetime.
    pub unsafe fn flush_and_destroy(
        &mut self,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        for cls in 0..NUM_SIZE_CLASSES {
            let list = &mut self.lists[cls];
            if list.length == 0 {
                continue;
            }
            let (count, head, _tail) = list.pop_batch(list.length);
            if count > 0 {
                unsafe { central.get(cls).lock().release_range(head, count as usize, page_heap, pagemap) };
            }
        }
    }

    /// `allocate(size)` fast path / `fetch_from_central` slow path.
    ///
    /// # Safety
    /// `size_class` must be a valid index in `0..NUM_SIZE_CLASSES`.
    #[inline]
    pub unsafe fn allocate(
        &mut self,
        size_class: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) -> *mut u8 {
        let list = &mut self.lists[size_class];
        let obj = list.pop();
        if !obj.is_null() {
            stat_inc!(thread_cache_hits);
            return obj as *mut u8;
        }
        unsafe { self.fetch_from_central(size_class, central, page_heap, pagemap) }
    }

    /// `deallocate(addr, size)` fast path / `return_to_central` slow path.
    ///
    /// # Safety
    /// `ptr` must have been returned by a prior `allocate` call for `size_class`.
    #[inline]
    pub unsafe fn deallocate(
        &mut self,
        ptr: *mut u8,
        size_class: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        let list = &mut self.lists[size_class];
        list.push(ptr as *mut FreeObject);

        if list.length >= list.adaptive_batch {
            unsafe { self.return_to_central(size_class, central, page_heap, pagemap) };
        }
    }

    /// `fetch_from_central(cls)`: pull a batch of objects from the central
    /// cache on a local free-list miss, pushing any leftovers onto the
    /// thread-local list.
    #[cold]
    unsafe fn fetch_from_central(
        &mut self,
        size_class: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) -> *mut u8 {
        let move_size = size_class::num_move_size(size_class::class_to_size(size_class));
        let list = &mut self.lists[size_class];
        let want = (list.adaptive_batch as usize).min(move_size);

        let (got, head) =
            unsafe { central.get(size_class).lock().fetch_range(want, page_heap, pagemap) };
        if got == 0 || head.is_null() {
            return ptr::null_mut();
        }

        let result = head;
        let remaining_head = unsafe { (*head).next };
        let remaining_count = got - 1;
        if remaining_count > 0 {
            list.push_batch(remaining_head, remaining_count as u32);
        }

        if list.adaptive_batch as usize == got && got < move_size {
            list.adaptive_batch += 1;
        }

        result as *mut u8
    }

    /// `return_to_central(cls, n)`: release exactly the current adaptive
    /// batch size (or all cached objects, if fewer).
    unsafe fn return_to_central(
        &mut self,
        size_class: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        let list = &mut self.lists[size_class];
        let to_release = list.adaptive_batch.min(list.length);
        if to_release == 0 {
            return;
        }

        let (count, head, _tail) = list.pop_batch(to_release);
        unsafe {
            central.get(size_class).lock().release_range(head, count as usize, page_heap, pagemap)
        };
    }
}
