//! Priority derivation (§4.3.4).

use chrono::{DateTime, Utc};
use shared::model::{MessagePriority, Task};

const URGENT: i32 = MessagePriority::Urgent as i32;

/// `base = task.priority`, +2 if `frequency ≤ 60s`, +1 if `≤ 300s`; +3 if
/// `next_run` lagged more than 5 minutes, +1 if more than 1 minute.
/// Clamped to `[0, URGENT]`.
pub fn derive_priority(task: &Task, now: DateTime<Utc>) -> i32 {
    let mut priority = task.priority;

    if task.frequency_seconds <= 60 {
        priority += 2;
    } else if task.frequency_seconds <= 300 {
        priority += 1;
    }

    if let Some(next_run) = task.next_run {
        let lag = now - next_run;
        if lag > chrono::Duration::minutes(5) {
            priority += 3;
        } else if lag > chrono::Duration::minutes(1) {
            priority += 1;
        }
    }

    priority.clamp(0, URGENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::model::{Protocol, TaskStatus};
    use uuid::Uuid;

    fn task(priority: i32, frequency_seconds: u32, next_run: Option<DateTime<Utc>>) -> Task {
        Task {
            id: Uuid::new_v4(),
            owner_user_id: Uuid::new_v4(),
            description: None,
            protocol: Protocol::Http,
            target: "example.com".into(),
            port: Some(80),
            parameters: Default::default(),
            frequency_seconds,
            timeout_seconds: 30,
            priority,
            status: TaskStatus::Active,
            next_run,
            preferred_location: None,
            preferred_isp: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn high_frequency_tasks_get_a_boost() {
        let now = Utc::now();
        assert_eq!(derive_priority(&task(0, 60, None), now), 2);
        assert_eq!(derive_priority(&task(0, 300, None), now), 1);
        assert_eq!(derive_priority(&task(0, 3600, None), now), 0);
    }

    #[test]
    fn lagging_next_run_adds_urgency() {
        let now = Utc::now();
        let lagged_far = now - chrono::Duration::minutes(10);
        let lagged_near = now - chrono::Duration::minutes(2);
        assert_eq!(derive_priority(&task(0, 3600, Some(lagged_far)), now), 3);
        assert_eq!(derive_priority(&task(0, 3600, Some(lagged_near)), now), 1);
    }

    #[test]
    fn priority_is_clamped_to_urgent() {
        let now = Utc::now();
        let lagged_far = now - chrono::Duration::minutes(10);
        assert_eq!(derive_priority(&task(4, 60, Some(lagged_far)), now), URGENT);
    }
}
