//! Top-level allocator: ties all tiers together and implements `GlobalAlloc`.
//!
//! Static state lives here. `RuMalloc` is zero-sized; all mutable state is
//! in module-level statics protected by spinlocks or atomics.
//!
//! Cache strategy (fastest to slowest):
//! - `nightly` feature: `#[thread_local]` with const-init (single TLS read, no branches)
//! - `std` feature: `std::thread_local!` with const-init (no lazy init overhead)
//! - neither: central cache only (locked, slowest)
//!
//! Exactly three tiers: thread cache, central cache, page cache. No per-CPU
//! slab tier sits between thread and central caches here.

use crate::central_free_list::CentralCache;
use crate::config::{PAGE_SHIFT, PAGE_SIZE};
use crate::page_heap::{PageHeap, SystemPageSource};
use crate::pagemap::PageMap;
use crate::size_class;
use crate::sync::SpinMutex;
use crate::{stat_add, stat_inc};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

cfg_if::cfg_if! {
    if #[cfg(any(feature = "nightly", feature = "std"))] {
        use crate::thread_cache::ThreadCache;
    }
}

use crate::span::{self, FreeObject};

static SYSTEM_PAGE_SOURCE: SystemPageSource = SystemPageSource;
pub(crate) static PAGE_MAP: PageMap = PageMap::new();
pub(crate) static PAGE_HEAP: SpinMutex<PageHeap> =
    SpinMutex::new(PageHeap::new(&PAGE_MAP, &SYSTEM_PAGE_SOURCE));
pub(crate) static CENTRAL_CACHE: CentralCache = CentralCache::new();

cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        #[derive(Clone, Copy, PartialEq)]
        #[repr(u8)]
        enum TlsState {
            Uninitialized = 0,
            Active = 1,
            Destroyed = 2,
        }

        struct TlsSlot<T> {
            state: TlsState,
            content: T,
        }

        #[inline(always)]
        unsafe fn tc() -> *mut ThreadCache {
            unsafe { core::ptr::addr_of_mut!(TC.content) }
        }

        #[thread_local]
        static mut TC: TlsSlot<ThreadCache> = TlsSlot {
            state: TlsState::Uninitialized,
            content: ThreadCache::new(),
        };

        /// Flush the ThreadCache and mark TC as Destroyed (reentrancy-safe).
        #[cold]
        #[allow(dead_code)] // Only called from cleanup modules (std feature)
        unsafe fn tc_destroy() {
            unsafe {
                if TC.state == TlsState::Active {
                    TC.state = TlsState::Destroyed;
                    (*tc()).flush_and_destroy(&CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP);
                }
            }
        }

        #[cold]
        #[inline(never)]
        unsafe fn tc_init() {
            // Set BEFORE cleanup registration — if register() triggers allocation,
            // the reentrant call sees TC as Active and uses it normally.
            unsafe { TC.state = TlsState::Active };
            tc_cleanup::register();
        }

        #[cfg(feature = "std")]
        mod tc_cleanup {
            struct Guard;

            impl Drop for Guard {
                fn drop(&mut self) {
                    if unsafe { super::TC.state } == super::TlsState::Active {
                        unsafe { super::tc_destroy() };
                    }
                }
            }

            std::thread_local! {
                static GUARD: Guard = const { Guard };
            }

            pub(super) fn register() {
                // Use try_with: if std's TLS is already destroyed (rare edge case
                // during thread shutdown), silently skip — the ThreadCache leaks.
                let _ = GUARD.try_with(|_| {});
            }
        }

        #[cfg(not(feature = "std"))]
        mod tc_cleanup {
            pub(super) fn register() {}
        }
    } else if #[cfg(feature = "std")] {
        std::thread_local! {
            static TC_CELL: core::cell::UnsafeCell<ThreadCache> = const {
                core::cell::UnsafeCell::new(ThreadCache::new())
            };
        }
    }
}

/// A concurrent, three-tier (thread cache / central cache / page cache)
/// small-object allocator. Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: rumalloc::RuMalloc = rumalloc::RuMalloc;
/// ```
pub struct RuMalloc;

unsafe impl GlobalAlloc for RuMalloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }

        stat_inc!(alloc_count);
        stat_add!(alloc_bytes, size as u64);

        let align = layout.align();

        if align <= 8 {
            if let Some(class) = size_class::size_to_class(size) {
                return unsafe { self.alloc_small(class) };
            }
        } else {
            let effective_size = size.max(align);
            if let Some(class) = size_class::size_to_class(effective_size) {
                let class_size = size_class::class_to_size(class);
                if align > PAGE_SIZE || !class_size.is_multiple_of(align) {
                    return unsafe { self.alloc_large(layout) };
                }
                return unsafe { self.alloc_small(class) };
            }
        }

        unsafe { self.alloc_large(layout) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 || ptr.is_null() {
            return;
        }

        stat_inc!(dealloc_count);

        // Look up the actual size class from span metadata rather than trust
        // layout.size(): realloc may have returned the same pointer for an
        // in-place shrink, so the caller's layout can disagree with the
        // span's real size class. The page map is read lock-free — writes to
        // it are the only thing the PC mutex guards.
        let page_id = (ptr as usize) >> PAGE_SHIFT;
        let span = PAGE_MAP.get(page_id);
        if span.is_null() {
            crate::fatal!("dealloc: address not owned by this allocator");
        }

        // `size_class` alone can't disambiguate "class 0" (a real, 8-byte
        // class) from "big object" (which also stores 0 there) — dispatch on
        // `state` instead.
        match unsafe { (*span).state } {
            crate::span::SpanState::Active => {
                let sc = unsafe { (*span).size_class };
                unsafe { self.dealloc_small(ptr, sc) };
            }
            crate::span::SpanState::BigLive => {
                unsafe { PAGE_HEAP.lock().free_big_span(span) };
            }
            // A `Free` span is already back in the page cache's pool — the
            // object handed to us here was freed once already.
            crate::span::SpanState::Free => crate::fatal!("double free detected"),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() && layout.size() > 0 {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if ptr.is_null() || layout.size() == 0 {
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            return unsafe { self.alloc(new_layout) };
        }

        if new_size == 0 {
            unsafe { self.dealloc(ptr, layout) };
            return layout.align() as *mut u8;
        }

        stat_inc!(realloc_count);

        let page_id = (ptr as usize) >> PAGE_SHIFT;
        let span = PAGE_MAP.get(page_id);
        if span.is_null() {
            crate::fatal!("realloc: address not owned by this allocator");
        }
        let old_usable = match unsafe { (*span).state } {
            crate::span::SpanState::Active => {
                size_class::class_to_size(unsafe { (*span).size_class })
            }
            crate::span::SpanState::BigLive => unsafe { (*span).objsize },
            crate::span::SpanState::Free => crate::fatal!("realloc on a freed address"),
        };

        // Fits in current allocation — return same pointer.
        if new_size <= old_usable {
            return ptr;
        }

        // Must grow — allocate, copy, free.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size)) };
            unsafe { self.dealloc(ptr, layout) };
        }
        new_ptr
    }
}

impl RuMalloc {
    cfg_if::cfg_if! {
        if #[cfg(feature = "nightly")] {
            #[inline(always)]
            unsafe fn alloc_small(&self, class: usize) -> *mut u8 {
                if unsafe { TC.state } == TlsState::Active {
                    return unsafe { (*tc()).allocate(class, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP) };
                }
                unsafe { self.alloc_small_slow(class) }
            }

            #[cold]
            #[inline(never)]
            unsafe fn alloc_small_slow(&self, class: usize) -> *mut u8 {
                if unsafe { TC.state } == TlsState::Uninitialized {
                    unsafe { tc_init() };
                    return unsafe { (*tc()).allocate(class, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP) };
                }
                unsafe { self.alloc_from_central(class) }
            }

            #[inline(always)]
            unsafe fn dealloc_small(&self, ptr: *mut u8, class: usize) {
                if unsafe { TC.state } == TlsState::Active {
                    unsafe { (*tc()).deallocate(ptr, class, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP) };
                    return;
                }
                unsafe { self.dealloc_to_central(ptr, class) };
            }
        } else if #[cfg(feature = "std")] {
            #[inline(always)]
            unsafe fn alloc_small(&self, class: usize) -> *mut u8 {
                match TC_CELL.try_with(|cell| unsafe {
                    let tc = &mut *cell.get();
                    tc.allocate(class, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP)
                }) {
                    Ok(ptr) => ptr,
                    Err(_) => unsafe { self.alloc_from_central(class) },
                }
            }

            #[inline(always)]
            unsafe fn dealloc_small(&self, ptr: *mut u8, class: usize) {
                if TC_CELL.try_with(|cell| unsafe {
                    let tc = &mut *cell.get();
                    tc.deallocate(ptr, class, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP);
                })
                .is_err()
                {
                    unsafe { self.dealloc_to_central(ptr, class) };
                }
            }
        } else {
            #[inline(always)]
            unsafe fn alloc_small(&self, class: usize) -> *mut u8 {
                unsafe { self.alloc_from_central(class) }
            }

            #[inline(always)]
            unsafe fn dealloc_small(&self, ptr: *mut u8, class: usize) {
                unsafe { self.dealloc_to_central(ptr, class) };
            }
        }
    }

    cfg_if::cfg_if! {
        if #[cfg(not(any(feature = "nightly", feature = "std")))] {
            unsafe fn alloc_from_central(&self, size_class: usize) -> *mut u8 {
                stat_inc!(thread_cache_misses);
                stat_inc!(central_cache_hits);
                let (got, head) = unsafe {
                    CENTRAL_CACHE.get(size_class).lock().fetch_range(1, &PAGE_HEAP, &PAGE_MAP)
                };
                if got == 0 || head.is_null() {
                    ptr::null_mut()
                } else {
                    head as *mut u8
                }
            }

            unsafe fn dealloc_to_central(&self, ptr: *mut u8, size_class: usize) {
                let obj = ptr as *mut FreeObject;
                unsafe { (*obj).next = ptr::null_mut() };
                unsafe {
                    CENTRAL_CACHE.get(size_class).lock().release_range(obj, 1, &PAGE_HEAP, &PAGE_MAP)
                };
            }
        } else {
            unsafe fn alloc_from_central(&self, size_class: usize) -> *mut u8 {
                stat_inc!(thread_cache_misses);
                stat_inc!(central_cache_hits);
                let (got, head) = unsafe {
                    CENTRAL_CACHE.get(size_class).lock().fetch_range(1, &PAGE_HEAP, &PAGE_MAP)
                };
                if got == 0 || head.is_null() {
                    ptr::null_mut()
                } else {
                    head as *mut u8
                }
            }

            unsafe fn dealloc_to_central(&self, ptr: *mut u8, size_class: usize) {
                let obj = ptr as *mut crate::span::FreeObject;
                unsafe { (*obj).next = ptr::null_mut() };
                unsafe {
                    CENTRAL_CACHE.get(size_class).lock().release_range(obj, 1, &PAGE_HEAP, &PAGE_MAP)
                };
            }
        }
    }

    /// Requests above `MAX_BYTES`: the page cache's big-object path,
    /// plus an over-alignment trim for `align > PAGE_SIZE`.
    unsafe fn alloc_large(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        let align = layout.align();

        if align <= PAGE_SIZE {
            // `alloc_big_span` rounds up to a whole number of pages, so a
            // page-aligned span already satisfies any `align <= PAGE_SIZE` —
            // no need to pad the request past what it actually asked for.
            let span = unsafe { PAGE_HEAP.lock().alloc_big_span(size) };
            if span.is_null() {
                return ptr::null_mut();
            }
            return unsafe { (*span).start_addr() };
        }

        // Over-aligned: allocate extra pages and trim prefix/suffix, like
        // tcmalloc's do_memalign. The trimmed fragments go back into the
        // page heap's free-span pool rather than straight back to the OS.
        let size_pages = size.div_ceil(PAGE_SIZE);
        let align_pages = align / PAGE_SIZE;
        let total_pages = size_pages + align_pages - 1;

        let mut heap = PAGE_HEAP.lock();
        let span = unsafe { heap.new_span_unbounded(total_pages) };
        if span.is_null() {
            return ptr::null_mut();
        }

        let start_addr = unsafe { (*span).start_addr() } as usize;
        let aligned_addr = (start_addr + align - 1) & !(align - 1);
        let prefix_pages = (aligned_addr - start_addr) / PAGE_SIZE;
        let suffix_pages = total_pages - prefix_pages - size_pages;

        unsafe {
            PAGE_MAP.unregister_span(span);

            if prefix_pages > 0 {
                let prefix = span::alloc_span();
                if !prefix.is_null() {
                    (*prefix).pageid = (*span).pageid;
                    (*prefix).npage = prefix_pages;
                    (*prefix).state = crate::span::SpanState::Active;
                    heap.release_span(prefix);
                }
            }

            (*span).pageid += prefix_pages;
            (*span).npage = size_pages;
            (*span).size_class = 0;
            (*span).objsize = size_pages * PAGE_SIZE;
            (*span).state = crate::span::SpanState::BigLive;
            PAGE_MAP.register_span(span);

            if suffix_pages > 0 {
                let suffix = span::alloc_span();
                if !suffix.is_null() {
                    (*suffix).pageid = (*span).pageid + size_pages;
                    (*suffix).npage = suffix_pages;
                    (*suffix).state = crate::span::SpanState::Active;
                    heap.release_span(suffix);
                }
            }
        }

        stat_inc!(page_heap_allocs);
        aligned_addr as *mut u8
    }
}

#[cfg(feature = "nightly")]
unsafe impl core::alloc::Allocator for RuMalloc {
    fn allocate(
        &self,
        layout: Layout,
    ) -> Result<core::ptr::NonNull<[u8]>, core::alloc::AllocError> {
        let ptr = unsafe { GlobalAlloc::alloc(self, layout) };
        if ptr.is_null() {
            Err(core::alloc::AllocError)
        } else {
            let slice = core::ptr::slice_from_raw_parts_mut(ptr, layout.size());
            Ok(unsafe { core::ptr::NonNull::new_unchecked(slice) })
        }
    }

    unsafe fn deallocate(&self, ptr: core::ptr::NonNull<u8>, layout: Layout) {
        unsafe { GlobalAlloc::dealloc(self, ptr.as_ptr(), layout) }
    }
}
