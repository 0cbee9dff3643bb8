//! Audit log filters and pagination

use super::types::{AuditEvent, AuditStatus, EventType};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Time window for audit queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DateRange {
    /// Since midnight UTC
    Today,
    /// Since midnight UTC seven days ago
    Week,
    /// Since midnight UTC thirty days ago
    Month,
    /// Explicit bounds, both inclusive
    Custom {
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    },
    /// No time restriction
    #[default]
    All,
}

impl DateRange {
    /// Resolve into concrete (since, until) bounds relative to `now`
    pub fn bounds(&self, now: DateTime<Utc>) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .unwrap_or(now);

        match *self {
            DateRange::Today => (Some(midnight), None),
            DateRange::Week => (Some(midnight - Duration::days(7)), None),
            DateRange::Month => (Some(midnight - Duration::days(30)), None),
            DateRange::Custom { from, to } => (from, to),
            DateRange::All => (None, None),
        }
    }
}

impl FromStr for DateRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "today" => Ok(DateRange::Today),
            "week" => Ok(DateRange::Week),
            "month" => Ok(DateRange::Month),
            "all" | "" => Ok(DateRange::All),
            other => Err(format!("Unknown date range: {}", other)),
        }
    }
}

/// Caller-facing audit log filter
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub event_type: Option<EventType>,
    /// Case-insensitive substring matched against username and resource
    pub search: Option<String>,
    pub date_range: DateRange,
    pub status: Option<AuditStatus>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn date_range(mut self, date_range: DateRange) -> Self {
        self.date_range = date_range;
        self
    }

    pub fn status(mut self, status: AuditStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Resolve relative ranges against `now` into criteria a store can apply
    pub fn criteria(&self, now: DateTime<Utc>) -> AuditCriteria {
        let (since, until) = self.date_range.bounds(now);
        AuditCriteria {
            event_type: self.event_type,
            search: self
                .search
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_lowercase),
            since,
            until,
            status: self.status,
        }
    }
}

/// Fully resolved filter with absolute bounds, as consumed by storage backends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditCriteria {
    pub event_type: Option<EventType>,
    /// Lowercased search term
    pub search: Option<String>,
    /// Inclusive lower bound
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound
    pub until: Option<DateTime<Utc>>,
    pub status: Option<AuditStatus>,
}

impl AuditCriteria {
    /// Everything at or after `since`
    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        if self.event_type.is_some_and(|t| t != event.event_type) {
            return false;
        }
        if self.status.is_some_and(|s| s != event.status) {
            return false;
        }
        if self.since.is_some_and(|since| event.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.timestamp > until) {
            return false;
        }
        if let Some(term) = &self.search {
            let hit = event.username.to_lowercase().contains(term.as_str())
                || event.resource.to_lowercase().contains(term.as_str());
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Offset/limit page request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: u64,
    /// `None` uses the configured default page size
    pub limit: Option<u64>,
}

impl PageRequest {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }

    pub fn first(limit: u64) -> Self {
        Self::new(0, limit)
    }
}

/// One page of results with the total number of matches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.offset + (self.items.len() as u64) < self.total
    }
}
