//! Session renewal policies
//!
//! When an established session should be torn down and renegotiated is a
//! deployment decision. The session manager asks a policy about every
//! established session when `renew_sessions` runs.

use core::fmt;
use core::time::Duration;

use p2p_link_core::{LinkManagerConfig, RenewalPolicyKind, SessionId, Timestamp};

/// Usage history of one established session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionActivity {
    pub session_id: SessionId,
    pub established_at: Timestamp,
    pub last_sent: Option<Timestamp>,
    pub last_received: Option<Timestamp>,
}

impl SessionActivity {
    /// Latest instant the session was established or used
    pub fn last_used(&self) -> Timestamp {
        [self.last_sent, self.last_received]
            .into_iter()
            .flatten()
            .fold(self.established_at, Timestamp::max)
    }
}

/// Decides whether an established session must be renegotiated
pub trait SessionRenewalPolicy: Send + Sync + fmt::Debug {
    fn should_renew(&self, activity: &SessionActivity, now: Timestamp) -> bool;
}

/// Sessions live until explicitly invalidated
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRenew;

impl SessionRenewalPolicy for NeverRenew {
    fn should_renew(&self, _activity: &SessionActivity, _now: Timestamp) -> bool {
        false
    }
}

/// Sessions unused for longer than `idle_timeout` are renegotiated
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeout {
    pub idle_timeout: Duration,
}

impl SessionRenewalPolicy for IdleTimeout {
    fn should_renew(&self, activity: &SessionActivity, now: Timestamp) -> bool {
        now.since(activity.last_used()) > self.idle_timeout
    }
}

/// Policy selected by the configuration
pub fn renewal_policy_for(config: &LinkManagerConfig) -> Box<dyn SessionRenewalPolicy> {
    match config.renewal {
        RenewalPolicyKind::Never => Box::new(NeverRenew),
        RenewalPolicyKind::IdleTimeout => Box::new(IdleTimeout {
            idle_timeout: config.session_timeouts.idle_timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(last_sent: Option<u64>, last_received: Option<u64>) -> SessionActivity {
        SessionActivity {
            session_id: SessionId::new("s-1"),
            established_at: Timestamp::new(1_000),
            last_sent: last_sent.map(Timestamp::new),
            last_received: last_received.map(Timestamp::new),
        }
    }

    #[test]
    fn test_last_used() {
        assert_eq!(activity(None, None).last_used(), Timestamp::new(1_000));
        assert_eq!(activity(Some(5_000), Some(3_000)).last_used(), Timestamp::new(5_000));
        assert_eq!(activity(None, Some(7_000)).last_used(), Timestamp::new(7_000));
    }

    #[test]
    fn test_idle_timeout_policy() {
        let policy = IdleTimeout {
            idle_timeout: Duration::from_secs(10),
        };
        let recent = activity(Some(5_000), None);

        assert!(!policy.should_renew(&recent, Timestamp::new(15_000)));
        assert!(policy.should_renew(&recent, Timestamp::new(15_001)));
        assert!(!NeverRenew.should_renew(&recent, Timestamp::new(u64::MAX)));
    }

    #[test]
    fn test_policy_from_config() {
        let policy = renewal_policy_for(&LinkManagerConfig::strict());
        let idle = activity(None, None);
        assert!(policy.should_renew(&idle, Timestamp::new(1_000) + Duration::from_secs(61)));

        let policy = renewal_policy_for(&LinkManagerConfig::default());
        assert!(!policy.should_renew(&idle, Timestamp::new(u64::MAX)));
    }
}
