use crate::error::BoxError;

/// Per-value destruction hook.
///
/// A [`LeaseMap`] built with [`with_finalizer`] invokes `finalize` exactly
/// once per entry instance: strictly after the last lease on the entry has
/// been released and before its slot becomes unreachable.  An `Err` return
/// is counted in [`Metrics::finalize_errors`] and otherwise dropped —
/// destruction always proceeds.
///
/// [`LeaseMap`]: crate::LeaseMap
/// [`with_finalizer`]: crate::LeaseMap::with_finalizer
/// [`Metrics::finalize_errors`]: crate::Metrics
pub trait Finalize {
    fn finalize(&self) -> Result<(), BoxError>;
}
