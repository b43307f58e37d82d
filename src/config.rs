//! Compile-time configuration constants.
//!
//! Every knob in this crate is a `pub const`. There is no configuration file
//! and no runtime configuration API — changing behavior means changing these
//! constants and recompiling.

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// Size of one page, the atom of [`crate::page_heap`]'s bookkeeping.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Ceiling for small-object requests. Above this, allocations go directly to
/// the page heap's big-object path.
pub const MAX_BYTES: usize = 256 * 1024;

/// Number of size classes (four alignment regimes spanning 1..=64 KiB).
pub const NFREELISTS: usize = 184;

/// The page heap maintains free-span lists for span sizes `1..=NPAGES-1`.
pub const NPAGES: usize = 129;

/// Largest pooled span size, in pages. Requests needing more pages than this
/// bypass the page heap's free-span lists and go straight to the system page
/// source as a one-off big span.
pub const MAX_POOLED_PAGES: usize = NPAGES - 1;

/// Number of pages requested from the system page source when the page heap
/// must grow (i.e. no existing free span, of any size, can satisfy a request).
pub const GROW_PAGES: usize = NPAGES - 1;
