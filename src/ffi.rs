//! C-ABI exports for external linking.
//!
//! Gated behind `features = ["ffi"]`. With the `testing` feature, export
//! names are prefixed by variant so a harness can link all three side by
//! side:
//!   - `nightly` → `rumalloc_nightly_*`
//!   - `std`     → `rumalloc_std_*`
//!   - neither   → `rumalloc_nostd_*`
//! Without `testing`, exports plain `rumalloc_*` names.

use crate::allocator::RuMalloc;
use core::alloc::{GlobalAlloc, Layout};

static ALLOC: RuMalloc = RuMalloc;

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "rumalloc_nightly_alloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "rumalloc_std_alloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "rumalloc_nostd_alloc")
)]
pub unsafe extern "C" fn rumalloc_alloc(size: usize, align: usize) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.alloc(layout) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "rumalloc_nightly_dealloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "rumalloc_std_dealloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "rumalloc_nostd_dealloc")
)]
pub unsafe extern "C" fn rumalloc_dealloc(ptr: *mut u8, size: usize, align: usize) {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.dealloc(ptr, layout) }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "rumalloc_nightly_realloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "rumalloc_std_realloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "rumalloc_nostd_realloc")
)]
pub unsafe extern "C" fn rumalloc_realloc(
    ptr: *mut u8,
    size: usize,
    align: usize,
    new_size: usize,
) -> *mut u8 {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.realloc(ptr, layout, new_size) }
}
