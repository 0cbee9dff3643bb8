//! Aggregate statistics and anomaly detection over audit events

use super::types::{AuditEvent, AuditStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Address used when a failed login carries no client IP
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Dashboard counters over a time window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStats {
    /// Start of the window, `None` for all time
    pub window_start: Option<DateTime<Utc>>,
    pub total_events: u64,
    pub failed_logins: u64,
    /// Distinct usernames with at least one successful event
    pub active_users: u64,
    /// Events in the 24 hours before the report time, regardless of window
    pub events_last_24h: u64,
    /// Failed or denied actions other than logins
    pub unauthorized_attempts: u64,
    /// Events touching the roles table
    pub role_changes: u64,
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
}

/// What pattern raised an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Repeated failed logins from one address
    FailedLogins,
    /// One user touching an unusual number of distinct resources
    UnusualAccess,
}

/// A suspicious pattern found in the audit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub id: u32,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    /// Client address or username the alert is about
    pub subject: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

/// Tunables for [`detect_anomalies`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnomalyThresholds {
    pub failed_login_threshold: u64,
    pub high_severity_threshold: u64,
    pub failed_login_window: Duration,
    pub resource_spread_threshold: u64,
    pub resource_spread_window: Duration,
}

impl AnomalyThresholds {
    /// Widest window either rule looks at
    pub fn lookback(&self) -> Duration {
        self.failed_login_window.max(self.resource_spread_window)
    }
}

/// Compute counters for events at or after `window_start`
pub fn aggregate(
    events: &[AuditEvent],
    window_start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> AuditStats {
    let day_ago = now - Duration::hours(24);
    let in_window = |e: &&AuditEvent| window_start.map_or(true, |start| e.timestamp >= start);

    let mut stats = AuditStats {
        window_start,
        total_events: 0,
        failed_logins: 0,
        active_users: 0,
        events_last_24h: 0,
        unauthorized_attempts: 0,
        role_changes: 0,
    };
    let mut active = HashSet::new();

    for event in events.iter().filter(in_window) {
        stats.total_events += 1;
        if event.is_failed_login() {
            stats.failed_logins += 1;
        }
        if event.is_unauthorized_attempt() {
            stats.unauthorized_attempts += 1;
        }
        if event.resource == "roles" {
            stats.role_changes += 1;
        }
        if event.status == AuditStatus::Success && !event.username.is_empty() {
            active.insert(event.username.as_str());
        }
    }

    stats.active_users = active.len() as u64;
    stats.events_last_24h = events
        .iter()
        .filter(|e| e.timestamp >= day_ago && e.timestamp <= now)
        .count() as u64;

    stats
}

/// Find repeated failed logins per address and users touching many resources.
///
/// Each address yields at most one alert; its severity reflects the full count
/// within the window.
pub fn detect_anomalies(
    events: &[AuditEvent],
    thresholds: &AnomalyThresholds,
    now: DateTime<Utc>,
) -> Vec<SecurityAlert> {
    let mut alerts = Vec::new();

    let login_since = now - thresholds.failed_login_window;
    let mut by_address: HashMap<&str, (u64, DateTime<Utc>)> = HashMap::new();
    for event in events
        .iter()
        .filter(|e| e.is_failed_login() && e.timestamp >= login_since && e.timestamp <= now)
    {
        let address = event.ip_address.as_deref().unwrap_or(UNKNOWN_ADDRESS);
        let entry = by_address.entry(address).or_insert((0, event.timestamp));
        entry.0 += 1;
        entry.1 = entry.1.max(event.timestamp);
    }

    let mut failed: Vec<_> = by_address
        .into_iter()
        .filter(|(_, (count, _))| *count >= thresholds.failed_login_threshold)
        .collect();
    failed.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then_with(|| a.0.cmp(b.0)));

    for (address, (count, last_seen)) in failed {
        let severity = if count >= thresholds.high_severity_threshold {
            Severity::High
        } else {
            Severity::Medium
        };
        alerts.push(SecurityAlert {
            id: 0,
            kind: AlertKind::FailedLogins,
            severity,
            message: format!("{} failed login attempts from IP {}", count, address),
            subject: address.to_string(),
            count,
            last_seen,
        });
    }

    let spread_since = now - thresholds.resource_spread_window;
    let mut by_user: HashMap<&str, (BTreeSet<&str>, DateTime<Utc>)> = HashMap::new();
    for event in events.iter().filter(|e| {
        !e.username.is_empty()
            && !e.is_failed_login()
            && e.timestamp >= spread_since
            && e.timestamp <= now
    }) {
        let entry = by_user
            .entry(event.username.as_str())
            .or_insert_with(|| (BTreeSet::new(), event.timestamp));
        entry.0.insert(event.resource.as_str());
        entry.1 = entry.1.max(event.timestamp);
    }

    let mut spread: Vec<_> = by_user
        .into_iter()
        .map(|(user, (resources, last_seen))| (user, resources.len() as u64, last_seen))
        .filter(|(_, count, _)| *count >= thresholds.resource_spread_threshold)
        .collect();
    spread.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    for (username, count, last_seen) in spread {
        alerts.push(SecurityAlert {
            id: 0,
            kind: AlertKind::UnusualAccess,
            severity: Severity::Medium,
            message: format!(
                "User {} accessed {} different resources in the last {} minutes",
                username,
                count,
                thresholds.resource_spread_window.num_minutes()
            ),
            subject: username.to_string(),
            count,
            last_seen,
        });
    }

    for (i, alert) in alerts.iter_mut().enumerate() {
        alert.id = (i + 1) as u32;
    }

    alerts
}
