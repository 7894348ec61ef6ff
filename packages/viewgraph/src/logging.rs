/// Debug logging under the crate's `viewgraph` target.
/// Usage: debug_log!("message {} {}", var1, var2);
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        tracing::debug!(target: "viewgraph", $($arg)*)
    };
}

// Re-export for internal use
pub use debug_log;
