//! Dispatch tokens: deterministic dedup keys for queued pipeline items.
//!
//! Tokens are always recomputed from their inputs and never stored.

use crate::state_machine::Stage;

/// Key for "run stage `stage` of job `job_id`".
pub fn advance_token(job_id: &str, stage: Stage) -> String {
    format!("advance:{job_id}:{stage}")
}

/// Key for poll number `attempt` of the task outstanding at `stage`.
pub fn poll_token(job_id: &str, stage: Stage, attempt: u32) -> String {
    format!("poll:{job_id}:{stage}:{attempt}")
}

/// Key for a pushed completion of `task_id`. `outcome` separates a success from a failure report.
pub fn resolve_token(job_id: &str, stage: Stage, task_id: &str, outcome: &str) -> String {
    format!("resolve:{job_id}:{stage}:{task_id}:{outcome}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_token_format() {
        assert_eq!(
            advance_token("job-1", Stage::Analyzing),
            "advance:job-1:analyzing"
        );
    }

    #[test]
    fn tokens_are_deterministic_and_distinct() {
        assert_eq!(
            poll_token("j", Stage::GeneratingMusic, 2),
            poll_token("j", Stage::GeneratingMusic, 2)
        );
        assert_ne!(
            poll_token("j", Stage::GeneratingMusic, 2),
            poll_token("j", Stage::GeneratingMusic, 3)
        );
        assert_ne!(
            advance_token("j", Stage::GeneratingImage),
            resolve_token("j", Stage::GeneratingImage, "t", "succeeded")
        );
    }
}
