//! Single-writer async results service and its event stream.

/// Event stream types emitted by the service.
pub mod events;
/// Handle and command loop implementation.
pub mod handle;
