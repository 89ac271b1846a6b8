//! Usage reset trigger
//!
//! Monthly usage counters are zeroed once per billing-period rollover. A
//! rollover is a subscription update whose period start is strictly after the
//! stored one; updates within the same period (cancellation toggles, status
//! changes, replays) never reset usage.

use time::OffsetDateTime;

use brandbase_shared::{Subscription, Workspace};

/// A usage reset, written in the same unit of work as the subscription update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageReset {
    pub period_starts_at: OffsetDateTime,
    pub period_ends_at: OffsetDateTime,
    pub reset_at: OffsetDateTime,
}

impl UsageReset {
    /// Zero the monthly counters and record the period they now count.
    /// Storage is a level, not a monthly counter.
    pub fn apply_to(&self, workspace: &mut Workspace) {
        workspace.period_starts_at = Some(self.period_starts_at);
        workspace.period_ends_at = Some(self.period_ends_at);
        workspace.usage_api_calls_count = 0;
        workspace.usage_ai_credits_used = 0;
        workspace.usage_insights_queries_count = 0;
        workspace.usage_reset_at = Some(self.reset_at);
    }
}

/// True when `new_period_start` rolls over the stored period
pub fn is_rollover(stored_period_start: Option<OffsetDateTime>, new_period_start: OffsetDateTime) -> bool {
    stored_period_start.is_some_and(|stored| new_period_start > stored)
}

/// The reset to perform for an update moving `stored` to the given period, if any
pub fn rollover_reset(
    stored: Option<&Subscription>,
    period_starts_at: OffsetDateTime,
    period_ends_at: OffsetDateTime,
    now: OffsetDateTime,
) -> Option<UsageReset> {
    is_rollover(stored.map(|s| s.period_starts_at), period_starts_at).then_some(UsageReset {
        period_starts_at,
        period_ends_at,
        reset_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{stored_subscription, ts, DAY, T0};
    use brandbase_shared::WorkspaceId;

    #[test]
    fn test_no_stored_period_is_not_rollover() {
        assert!(!is_rollover(None, ts(T0)));
    }

    #[test]
    fn test_same_period_is_not_rollover() {
        assert!(!is_rollover(Some(ts(T0)), ts(T0)));
    }

    #[test]
    fn test_older_period_is_not_rollover() {
        assert!(!is_rollover(Some(ts(T0)), ts(T0 - DAY)));
    }

    #[test]
    fn test_later_period_is_rollover() {
        assert!(is_rollover(Some(ts(T0)), ts(T0 + 30 * DAY)));
    }

    #[test]
    fn test_rollover_reset_carries_new_period() {
        let stored = stored_subscription(WorkspaceId::new(), "sub_1", T0);
        let reset = rollover_reset(Some(&stored), ts(T0 + 30 * DAY), ts(T0 + 60 * DAY), ts(T0 + 30 * DAY + 5))
            .expect("rollover");
        assert_eq!(reset.period_starts_at, ts(T0 + 30 * DAY));
        assert_eq!(reset.period_ends_at, ts(T0 + 60 * DAY));
        assert_eq!(reset.reset_at, ts(T0 + 30 * DAY + 5));

        assert!(rollover_reset(Some(&stored), ts(T0), ts(T0 + 30 * DAY), ts(T0)).is_none());
        assert!(rollover_reset(None, ts(T0), ts(T0 + 30 * DAY), ts(T0)).is_none());
    }

    #[test]
    fn test_apply_zeroes_monthly_counters_only() {
        let mut ws = Workspace::provisioned(WorkspaceId::new());
        ws.usage_api_calls_count = 1200;
        ws.usage_ai_credits_used = 75;
        ws.usage_insights_queries_count = 9;
        ws.usage_storage_bytes = 4096;

        let reset = UsageReset {
            period_starts_at: ts(T0),
            period_ends_at: ts(T0 + 30 * DAY),
            reset_at: ts(T0 + 1),
        };
        reset.apply_to(&mut ws);

        assert!(ws.usage().monthly_is_zero());
        assert_eq!(ws.usage_storage_bytes, 4096);
        assert_eq!(ws.period_starts_at, Some(ts(T0)));
        assert_eq!(ws.period_ends_at, Some(ts(T0 + 30 * DAY)));
        assert_eq!(ws.usage_reset_at, Some(ts(T0 + 1)));
    }
}
