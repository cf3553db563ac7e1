#![forbid(unsafe_code)]

/// Per-packet handle handed over by the capture subsystem.
///
/// Exactly one of `accept` or `drop` must be called for every packet; both
/// consume the handle, so the type system enforces the contract.
pub trait VerdictHandle {
    fn accept(self);
    #[allow(clippy::should_implement_trait)]
    fn drop(self);
}
