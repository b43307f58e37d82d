//! Central Cache (middle tier): per-size-class shared object pools.
//!
//! Each size class gets its own `CentralFreeList` behind its own mutex (the
//! "class mutex" below) for fine-grained concurrency — a thread cache
//! fetching/releasing class 7 objects never blocks one working with class
//! 40. When a class's span ring runs dry, a fresh span is carved from the
//! page heap.

use crate::config::PAGE_SHIFT;
use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::span::{FreeObject, Span, SpanList, SpanState};
use crate::sync::SpinMutex;
use core::ptr;
#[cfg(feature = "debug")]
use std::println;

/// Central free list for a single size class: its ring of in-use spans,
/// plus the count of free objects across all of them.
pub struct CentralFreeList {
    size_class: usize,
    nonempty_spans: SpanList,
    num_free: usize,
}

// SAFETY: Only accessed through the enclosing SpinMutex.
unsafe impl Send for CentralFreeList {}

impl CentralFreeList {
    pub const fn new(size_class: usize) -> Self {
        Self { size_class, nonempty_spans: SpanList::new(), num_free: 0 }
    }

    /// `fetch_range(cls, want)`: pop up to `want` objects, populating from
    /// the page heap if the ring has no span with free objects. Returns
    /// `(got, head)`; `got < want` only on exhaustion of a single span
    /// (fetches never cross spans) or OOM.
    ///
    /// # Safety
    /// Caller must hold the class mutex (the enclosing `SpinMutex`).
    pub unsafe fn fetch_range(
        &mut self,
        want: usize,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) -> (usize, *mut FreeObject) {
        if self.nonempty_spans.is_empty() && unsafe { self.populate(page_heap, pagemap) }.is_none()
        {
            return (0, ptr::null_mut());
        }

        let span = self.nonempty_spans.head;
        let mut head: *mut FreeObject = ptr::null_mut();
        let mut got = 0;

        unsafe {
            while got < want && !(*span).freelist.is_null() {
                let obj = (*span).freelist;
                (*span).freelist = (*obj).next;
                (*obj).next = head;
                head = obj;
                (*span).usecount += 1;
                got += 1;
                self.num_free -= 1;
            }

            if (*span).freelist.is_null() {
                self.nonempty_spans.remove(span);
            }
        }

        (got, head)
    }

    /// `release_range(cls, head, tail, n)`: push `n` objects back, resolving
    /// each one's owning span via the page map, and hand fully-drained spans
    /// back to the page heap while still holding the class mutex — a
    /// deliberate lock-holding asymmetry with `fetch_range`, which never
    /// holds the class mutex and the page heap mutex at once.
    ///
    /// # Safety
    /// `head` must chain exactly `count` live `FreeObject`s previously
    /// allocated from this class.
    pub unsafe fn release_range(
        &mut self,
        mut head: *mut FreeObject,
        count: usize,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        let mut remaining = count;

        while !head.is_null() && remaining > 0 {
            let obj = head;
            unsafe { head = (*obj).next };
            remaining -= 1;

            let page_id = (obj as usize) >> PAGE_SHIFT;
            let span = pagemap.get(page_id);
            if span.is_null() {
                continue;
            }

            unsafe {
                let was_full = (*span).freelist.is_null();

                (*obj).next = (*span).freelist;
                (*span).freelist = obj;
                (*span).usecount -= 1;
                self.num_free += 1;

                if was_full {
                    self.nonempty_spans.push(span);
                }

                if (*span).usecount == 0 {
                    self.nonempty_spans.remove(span);
                    self.num_free -= (*span).total_count as usize;
                    (*span).freelist = ptr::null_mut();
                    (*span).objsize = 0;
                    // Held under the class mutex; release_span acquires the
                    // page heap's own mutex internally.
                    page_heap.lock().release_span(span);
                }
            }
        }
    }

    /// Fetch a fresh span from the page heap and carve it into objects of
    /// this class's rounded size. Returns `None` on OOM.
    unsafe fn populate(&mut self, page_heap: &SpinMutex<PageHeap>, pagemap: &PageMap) -> Option<()> {
        let info = size_class::class_info(self.size_class);
        let span = unsafe { page_heap.lock().new_span(info.pages) };
        if span.is_null() {
            return None;
        }
        unsafe { self.inject_span(span, pagemap) };
        Some(())
    }

    /// Carve a freshly-pulled span into fixed-size objects and put it into
    /// the ring. Caller holds the class mutex.
    unsafe fn inject_span(&mut self, span: *mut Span, pagemap: &PageMap) {
        let info = size_class::class_info(self.size_class);
        let obj_size = info.bytes;

        unsafe {
            (*span).size_class = self.size_class;
            (*span).state = SpanState::Active;
            (*span).objsize = obj_size;

            #[cfg(feature = "debug")]
            println!("[inject] register_span");
            pagemap.register_span(span);

            let base = (*span).start_addr();
            let span_bytes = (*span).byte_size();
            let num_objects = span_bytes / obj_size;

            (*span).total_count = num_objects as u32;
            (*span).usecount = 0;

            let mut freelist: *mut FreeObject = ptr::null_mut();
            for i in (0..num_objects).rev() {
                let obj = base.add(i * obj_size) as *mut FreeObject;
                (*obj).next = freelist;
                freelist = obj;
            }

            (*span).freelist = freelist;
            self.num_free += num_objects;
            self.nonempty_spans.push(span);
        }
    }
}

/// One `CentralFreeList` per size class.
pub struct CentralCache {
    lists: [SpinMutex<CentralFreeList>; NUM_SIZE_CLASSES],
}

impl Default for CentralCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CentralCache {
    pub const fn new() -> Self {
        let mut lists = [const { SpinMutex::new(CentralFreeList::new(0)) }; NUM_SIZE_CLASSES];
        let mut i = 0;
        while i < NUM_SIZE_CLASSES {
            lists[i] = SpinMutex::new(CentralFreeList::new(i));
            i += 1;
        }
        Self { lists }
    }

    #[inline]
    pub fn get(&self, size_class: usize) -> &SpinMutex<CentralFreeList> {
        &self.lists[size_class]
    }
}
