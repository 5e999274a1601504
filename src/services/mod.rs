/// Countdown toward the attempt deadline and the ticker driving it.
pub mod clock;
/// Single terminal call guarded by the drain-then-submit protocol.
pub mod finalizer;
/// Connectivity and visibility tracking.
pub mod network;
/// Answer persistence with bounded retries and last-write-wins.
pub mod save_queue;
/// Controller actor serializing every mutation of a session.
pub mod session;
