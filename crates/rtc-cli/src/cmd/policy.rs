use crate::output::print_json;
use rtc_core::retry::should_retry;

pub fn run(
    attempt_count: usize,
    last_succeeded: bool,
    max_attempts: u32,
    json: bool,
) -> anyhow::Result<()> {
    let retry = should_retry(attempt_count, last_succeeded, max_attempts);
    let reason = if last_succeeded {
        "last attempt succeeded"
    } else if attempt_count >= max_attempts as usize {
        "attempt ceiling reached"
    } else {
        "last attempt failed and attempts remain"
    };

    if json {
        print_json(&serde_json::json!({
            "attempt_count": attempt_count,
            "last_succeeded": last_succeeded,
            "max_attempts": max_attempts,
            "retry": retry,
            "reason": reason,
        }))?;
    } else if retry {
        println!("retry: {reason}");
    } else {
        println!("stop: {reason}");
    }
    Ok(())
}
