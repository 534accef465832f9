//! Pipeline statistics counters. All mutations go through one hub-wide
//! mutex so a snapshot is always internally consistent.

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubCounters {
    pub archived: u64,
    pub dropped: u64,
    pub error: u64,
    pub conversation_warning: u64,
    pub conversation_error: u64,
    pub conversation_total: u64,
}

#[derive(Default)]
pub struct HubStats {
    counters: Mutex<HubCounters>,
}

impl HubStats {
    pub fn snapshot(&self) -> HubCounters {
        *self.counters.lock()
    }

    pub fn incr_archived(&self) {
        self.counters.lock().archived += 1;
    }

    pub fn incr_dropped(&self) {
        self.counters.lock().dropped += 1;
    }

    pub fn incr_error(&self) {
        self.counters.lock().error += 1;
    }

    /// Accounts one finished conversation: every call bumps the total,
    /// plus the warning or error bucket when flagged.
    pub fn count_conversation(&self, warning: bool, error: bool) {
        let mut counters = self.counters.lock();
        counters.conversation_total += 1;
        if error {
            counters.conversation_error += 1;
        } else if warning {
            counters.conversation_warning += 1;
        }
    }
}
