use chrono::{DateTime, Duration, Utc};

/// Backend-agnostic description of the messages a fetch wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    /// Sender addresses, in configured order.
    pub senders: Vec<String>,
    /// Lower bound on the received time, inclusive. `None` means no time filter.
    pub received_after: Option<DateTime<Utc>>,
}

impl SearchQuery {
    /// When fetched messages are deleted there is nothing old left to skip,
    /// so no time filter is applied. Otherwise the bound is `after - skew`,
    /// which tolerates clock drift and late indexing at the cost of
    /// occasionally seeing a message twice.
    pub fn build(
        after: DateTime<Utc>,
        senders: &[String],
        delete_fetched: bool,
        skew: Duration,
    ) -> Self {
        let senders = senders
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        let received_after = if delete_fetched {
            None
        } else {
            Some(after - skew)
        };
        Self {
            senders,
            received_after,
        }
    }

    /// Client-side check for backends whose server-side filter is coarser
    /// than the bound. Messages without a known received time are kept.
    pub fn admits(&self, received_at: Option<DateTime<Utc>>) -> bool {
        match (self.received_after, received_at) {
            (Some(bound), Some(received)) => received >= bound,
            _ => true,
        }
    }
}
