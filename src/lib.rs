#![no_std]
#![cfg_attr(feature = "nightly", feature(thread_local))]

//! rumalloc: a concurrent three-tier small-object allocator.
//!
//! A drop-in `GlobalAlloc` with the tcmalloc-style tiering:
//! - Thread Cache — per-thread free lists, unsynchronized fast path
//!   (`#[thread_local]` with the `nightly` feature, `std::thread_local!`
//!   otherwise).
//! - Central Cache — per-size-class shared span rings, one mutex per class.
//! - Page Cache — global page-run manager with coalescing.
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: rumalloc::RuMalloc = rumalloc::RuMalloc;
//! ```

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod allocator;
pub mod central_free_list;
pub mod config;
pub mod error;
#[cfg(feature = "ffi")]
pub mod ffi;
pub mod macros;
pub mod page_heap;
pub mod pagemap;
pub mod platform;
pub mod size_class;
pub mod span;
#[cfg(feature = "stats")]
pub mod stats;
pub mod sync;
pub mod thread_cache;

pub use config::{MAX_BYTES, NFREELISTS, NPAGES, PAGE_SHIFT, PAGE_SIZE};

// Re-export the allocator at crate root for convenience
pub use allocator::RuMalloc;

// Panic handler for staticlib builds (no_std has no default panic handler).
// Only active when panic="abort" (i.e., the `fast` profile), not during normal checks.
#[cfg(all(feature = "ffi", not(test), not(feature = "std"), panic = "abort"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    unsafe extern "C" {
        fn abort() -> !;
    }
    unsafe { abort() }
}
