//! Wi-Fi link supervision.
//!
//! The connect sequence is asynchronous (the controller associates in
//! the background), but boot wants a synchronous answer: either the
//! link came up or it was abandoned. `RetryPolicy` does the retry
//! accounting and `LinkOutcome` is the one-shot verdict the rest of
//! the firmware gates on.

/// Disconnect retry ceiling before the link attempt is abandoned.
pub const MAX_LINK_RETRIES: u8 = 3;

/// Verdict of the boot-time connection handshake, delivered once over
/// a signal. First writer wins; later link churn is only logged.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum LinkOutcome {
    /// Associated and holding a DHCP lease.
    Up,
    /// Retry budget exhausted, link abandoned.
    Failed,
}

/// What to do about a disconnect.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum LinkStep {
    /// Budget remains, issue another connect.
    Retry,
    /// Budget exhausted, stop trying.
    GiveUp,
}

/// Retry accounting for the station connect sequence.
///
/// Each disconnect (or connect attempt that never associates) consumes
/// one retry; a successful association restores the full budget.
pub struct RetryPolicy {
    max_retries: u8,
    attempts: u8,
}

impl RetryPolicy {
    pub const fn new(max_retries: u8) -> Self {
        Self {
            max_retries,
            attempts: 0,
        }
    }

    /// Decide how to react to a disconnect.
    pub fn on_disconnected(&mut self) -> LinkStep {
        if self.attempts < self.max_retries {
            self.attempts += 1;
            LinkStep::Retry
        } else {
            LinkStep::GiveUp
        }
    }

    /// A successful association restores the full retry budget.
    pub fn on_connected(&mut self) {
        self.attempts = 0;
    }

    /// Retries consumed since the last successful association.
    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    pub fn max_retries(&self) -> u8 {
        self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(MAX_LINK_RETRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_exactly_max_times_then_gives_up() {
        let mut policy = RetryPolicy::default();

        for i in 1..=MAX_LINK_RETRIES {
            assert_eq!(policy.on_disconnected(), LinkStep::Retry);
            assert_eq!(policy.attempts(), i);
        }
        assert_eq!(policy.on_disconnected(), LinkStep::GiveUp);
    }

    #[test]
    fn give_up_is_sticky_without_a_reconnect() {
        let mut policy = RetryPolicy::new(1);
        assert_eq!(policy.on_disconnected(), LinkStep::Retry);
        assert_eq!(policy.on_disconnected(), LinkStep::GiveUp);
        assert_eq!(policy.on_disconnected(), LinkStep::GiveUp);
    }

    #[test]
    fn successful_connect_restores_the_budget() {
        let mut policy = RetryPolicy::default();

        assert_eq!(policy.on_disconnected(), LinkStep::Retry);
        assert_eq!(policy.on_disconnected(), LinkStep::Retry);
        policy.on_connected();
        assert_eq!(policy.attempts(), 0);

        // Full budget available again after link loss.
        for _ in 0..MAX_LINK_RETRIES {
            assert_eq!(policy.on_disconnected(), LinkStep::Retry);
        }
        assert_eq!(policy.on_disconnected(), LinkStep::GiveUp);
    }

    #[test]
    fn association_without_a_usable_link_does_not_restore_the_budget() {
        // The budget is reset only when the link becomes usable (lease
        // acquired). An attempt that associates but drops during the
        // DHCP wait never reaches on_connected, so it burns a retry
        // like any other failure and the budget still runs out.
        let mut policy = RetryPolicy::default();
        for _ in 0..MAX_LINK_RETRIES {
            assert_eq!(policy.on_disconnected(), LinkStep::Retry);
        }
        assert_eq!(policy.on_disconnected(), LinkStep::GiveUp);
        assert_eq!(policy.attempts(), MAX_LINK_RETRIES);
    }

    #[test]
    fn zero_budget_gives_up_immediately() {
        let mut policy = RetryPolicy::new(0);
        assert_eq!(policy.on_disconnected(), LinkStep::GiveUp);
    }
}
