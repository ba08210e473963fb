//! Retry decision for the orchestration loop.
//!
//! The policy introduces no delay of its own: the gap between attempts is
//! governed by the callback wait deadline.

/// Decide whether another attempt should be started.
///
/// The `max_attempts` ceiling overrides everything else; below it, retry
/// exactly when the last attempt was not a success.
pub fn should_retry(attempt_count: usize, last_attempt_is_success: bool, max_attempts: u32) -> bool {
    if attempt_count >= max_attempts as usize {
        return false;
    }
    !last_attempt_is_success
}
