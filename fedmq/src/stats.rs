use serde_json::json;

use fedmq_utils::Counter;

/// Request counters of one gateway.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub registers: Counter,
    pub unregisters: Counter,
    pub forwards: Counter,
    pub deliveries: Counter,
    pub dropped: Counter,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "registers": self.registers.to_json(),
            "unregisters": self.unregisters.to_json(),
            "forwards": self.forwards.to_json(),
            "deliveries": self.deliveries.to_json(),
            "dropped": self.dropped.to_json(),
        })
    }

    /// Logs every counter with its rate since the previous call.
    pub fn log(&self, brokers: usize) {
        log::info!(
            "stats brokers: {}, registers: {} ({:.2}/s), unregisters: {} ({:.2}/s), forwards: {} ({:.2}/s), \
             deliveries: {} ({:.2}/s), dropped: {} ({:.2}/s)",
            brokers,
            self.registers.count(),
            self.registers.rate(),
            self.unregisters.count(),
            self.unregisters.rate(),
            self.forwards.count(),
            self.forwards.rate(),
            self.deliveries.count(),
            self.deliveries.rate(),
            self.dropped.count(),
            self.dropped.rate(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_json() {
        let stats = Stats::new();
        stats.forwards.inc();
        stats.forwards.inc();
        stats.dropped.inc();
        let v = stats.to_json();
        assert_eq!(v["forwards"]["count"], 2);
        assert_eq!(v["dropped"]["count"], 1);
        assert_eq!(v["registers"]["count"], 0);
    }
}
