//! Fatal invariant-violation paths: double free and freeing memory this
//! allocator never owned. Both are programmer errors with no recovery
//! attempted, so each case is verified via `#[should_panic]`.

use rumalloc::RuMalloc;
use std::alloc::{GlobalAlloc, Layout};

#[global_allocator]
static GLOBAL: RuMalloc = RuMalloc;

#[test]
#[should_panic(expected = "double free")]
fn double_free_is_fatal() {
    let layout = Layout::from_size_align(64, 8).unwrap();
    let ptr = unsafe { GLOBAL.alloc(layout) };
    assert!(!ptr.is_null());
    unsafe {
        GLOBAL.dealloc(ptr, layout);
        GLOBAL.dealloc(ptr, layout);
    }
}

#[test]
#[should_panic(expected = "not owned")]
fn freeing_unowned_address_is_fatal() {
    // A stack address was never handed out by `alloc`.
    let mut local = 0u8;
    let bogus = std::ptr::addr_of_mut!(local);
    let layout = Layout::from_size_align(8, 8).unwrap();
    unsafe { GLOBAL.dealloc(bogus, layout) };
}
