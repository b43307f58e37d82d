//! Fatal invariant-violation handling.
//!
//! Out-of-memory is the only recoverable failure this allocator has; every
//! other failure class (double free, freeing memory this allocator never
//! handed out) is a programmer error with no recovery attempt. [`fatal!`] is
//! the single call site for that path: it bumps a stats counter (so a crash
//! handler, or a secondary thread polling [`crate::stats::snapshot`], can see
//! which invariant class tripped) before handing off to `core::panic!`.
//!
//! Internal fallible calls (`page_heap::new_span`, `alloc_big_span`, ...)
//! signal failure with a null `*mut Span` rather than a `Result` — consistent
//! with the raw-pointer idiom the rest of the page cache and span tables use,
//! and with `GlobalAlloc` itself, whose own contract has no room for a named
//! error type (failure there is a null return).

/// Abort with a fatal invariant-violation message, after recording it in
/// `stats::STATS.invariant_violations`.
///
/// No recovery is attempted: a double free or a free of memory this
/// allocator never owned is a programmer error, not a transient condition.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        $crate::stat_inc!(invariant_violations);
        ::core::panic!($($arg)*)
    }};
}
