//! Audit trail for security-relevant actions
//!
//! Every login, logout, administrative change and access decision is appended
//! to the audit log. Recording never fails the operation being audited: a
//! store error is logged and counted instead.

mod query;
mod report;
mod types;

pub use query::{AuditCriteria, AuditFilter, DateRange, Page, PageRequest};
pub use report::{
    aggregate, detect_anomalies, AlertKind, AnomalyThresholds, AuditStats, SecurityAlert,
    Severity, UNKNOWN_ADDRESS,
};
pub use types::{AuditEvent, AuditStatus, EventId, EventType, NewAuditEvent};

use crate::config::AuditConfig;
use crate::error::Result;
use crate::storage::StorageBackend;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Appends and queries audit events
pub struct AuditRecorder {
    storage: Arc<dyn StorageBackend>,
    config: AuditConfig,
    failures: AtomicU64,
}

impl AuditRecorder {
    pub fn new(storage: Arc<dyn StorageBackend>, config: AuditConfig) -> Self {
        Self {
            storage,
            config,
            failures: AtomicU64::new(0),
        }
    }

    /// Append one event. Returns the stored row, or `None` if the store
    /// rejected it.
    pub async fn record(&self, event: NewAuditEvent) -> Option<AuditEvent> {
        match self.storage.append_audit(&event).await {
            Ok(stored) => {
                tracing::debug!(
                    event_id = stored.event_id,
                    event_type = %stored.event_type,
                    resource = %stored.resource,
                    username = %stored.username,
                    status = %stored.status,
                    "Audit event recorded"
                );
                Some(stored)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    error = %e,
                    event_type = %event.event_type,
                    resource = %event.resource,
                    username = %event.username,
                    status = %event.status,
                    "Failed to record audit event"
                );
                None
            }
        }
    }

    /// Number of events that could not be recorded since startup
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Filtered, paginated listing, newest first
    pub async fn query(&self, filter: &AuditFilter, page: PageRequest) -> Result<Page<AuditEvent>> {
        self.query_at(filter, page, Utc::now()).await
    }

    /// As [`query`](Self::query), resolving relative date ranges against `now`
    pub async fn query_at(
        &self,
        filter: &AuditFilter,
        page: PageRequest,
        now: DateTime<Utc>,
    ) -> Result<Page<AuditEvent>> {
        let limit = page
            .limit
            .unwrap_or(self.config.default_page_size)
            .clamp(1, self.config.max_page_size);

        let slice = self
            .storage
            .query_audit(&filter.criteria(now), page.offset, Some(limit))
            .await?;

        Ok(Page {
            items: slice.events,
            total: slice.total,
            offset: page.offset,
            limit,
        })
    }

    /// Dashboard counters for a date range
    pub async fn aggregate(&self, range: DateRange) -> Result<AuditStats> {
        self.aggregate_at(range, Utc::now()).await
    }

    pub async fn aggregate_at(&self, range: DateRange, now: DateTime<Utc>) -> Result<AuditStats> {
        let (window_start, _) = range.bounds(now);
        let day_ago = now - Duration::hours(24);
        let since = window_start.map(|start| start.min(day_ago));

        let criteria = AuditCriteria {
            since,
            until: Some(now),
            ..AuditCriteria::default()
        };
        let slice = self.storage.query_audit(&criteria, 0, None).await?;

        Ok(aggregate(&slice.events, window_start, now))
    }

    /// Security alerts over the windows from `[audit]` in the config
    /// (`failed_login_window_hours`, `resource_spread_window_minutes`)
    pub async fn detect_anomalies(&self) -> Result<Vec<SecurityAlert>> {
        self.detect_anomalies_at(Utc::now()).await
    }

    pub async fn detect_anomalies_at(&self, now: DateTime<Utc>) -> Result<Vec<SecurityAlert>> {
        self.detect_anomalies_with(self.config.thresholds(), now).await
    }

    /// Configured thresholds, as a starting point for
    /// [`detect_anomalies_with`](Self::detect_anomalies_with)
    pub fn thresholds(&self) -> AnomalyThresholds {
        self.config.thresholds()
    }

    /// Security alerts over caller-chosen thresholds and windows
    pub async fn detect_anomalies_with(
        &self,
        thresholds: AnomalyThresholds,
        now: DateTime<Utc>,
    ) -> Result<Vec<SecurityAlert>> {
        let criteria = AuditCriteria {
            since: Some(now - thresholds.lookback()),
            until: Some(now),
            ..AuditCriteria::default()
        };
        let slice = self.storage.query_audit(&criteria, 0, None).await?;

        let alerts = detect_anomalies(&slice.events, &thresholds, now);
        if !alerts.is_empty() {
            tracing::warn!(alerts = alerts.len(), "Security alerts detected");
        }

        Ok(alerts)
    }

    /// Most recent failed logins
    pub async fn failed_logins(&self, limit: u64) -> Result<Vec<AuditEvent>> {
        let limit = limit.clamp(1, self.config.max_page_size);
        let mut failed = Vec::new();
        let mut offset = 0;

        // A failed login is LOGIN with a non-success status or a legacy
        // FAILED_LOGIN row, which one criteria cannot express.
        loop {
            let slice = self
                .storage
                .query_audit(&AuditCriteria::default(), offset, Some(self.config.max_page_size))
                .await?;
            let fetched = slice.events.len() as u64;

            failed.extend(slice.events.into_iter().filter(AuditEvent::is_failed_login));
            if failed.len() as u64 >= limit || fetched < self.config.max_page_size {
                break;
            }
            offset += fetched;
        }

        failed.truncate(limit as usize);
        Ok(failed)
    }

    /// Most recent events of any kind
    pub async fn recent_activity(&self, limit: u64) -> Result<Vec<AuditEvent>> {
        let page = self
            .query(&AuditFilter::default(), PageRequest::first(limit))
            .await?;
        Ok(page.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::outage::AuditOutage;
    use crate::storage::MemoryStorage;
    use chrono::TimeZone;

    fn recorder() -> AuditRecorder {
        AuditRecorder::new(Arc::new(MemoryStorage::new()), AuditConfig::default())
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_record_and_query() {
        let recorder = recorder();
        for i in 0..3 {
            recorder
                .record(
                    NewAuditEvent::new(EventType::Select, "patients", "nurseBob")
                        .at(now() - Duration::minutes(i)),
                )
                .await
                .unwrap();
        }
        recorder
            .record(NewAuditEvent::new(EventType::Login, "users", "admin").at(now()))
            .await
            .unwrap();

        let page = recorder
            .query_at(
                &AuditFilter::new().search("nurse"),
                PageRequest::first(2),
                now(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more());
        assert_eq!(recorder.failures(), 0);
    }

    #[tokio::test]
    async fn test_page_size_is_clamped() {
        let recorder = recorder();
        let page = recorder
            .query(&AuditFilter::default(), PageRequest::first(10_000))
            .await
            .unwrap();
        assert_eq!(page.limit, 500);

        let page = recorder
            .query(&AuditFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.limit, 50);
    }

    #[tokio::test]
    async fn test_failed_logins_include_legacy_rows() {
        let recorder = recorder();
        recorder
            .record(NewAuditEvent::new(EventType::Login, "users", "ghost").failed())
            .await;
        recorder
            .record(NewAuditEvent::new(EventType::FailedLogin, "users", "old"))
            .await;
        recorder
            .record(NewAuditEvent::new(EventType::Login, "users", "admin"))
            .await;

        let failed = recorder.failed_logins(20).await.unwrap();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(AuditEvent::is_failed_login));
    }

    #[tokio::test]
    async fn test_record_failure_is_swallowed_and_counted() {
        let recorder = AuditRecorder::new(Arc::new(AuditOutage::new()), AuditConfig::default());

        let stored = recorder
            .record(NewAuditEvent::new(EventType::Login, "users", "admin"))
            .await;
        assert!(stored.is_none());
        assert_eq!(recorder.failures(), 1);

        let page = recorder
            .query(&AuditFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn test_anomaly_window_override() {
        let recorder = recorder();
        for i in 0..3 {
            recorder
                .record(
                    NewAuditEvent::new(EventType::Login, "users", "ghost")
                        .failed()
                        .ip("10.0.0.5".parse().unwrap())
                        .at(now() - Duration::hours(2) - Duration::minutes(i)),
                )
                .await
                .unwrap();
        }

        let alerts = recorder.detect_anomalies_at(now()).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::FailedLogins);

        let narrow = AnomalyThresholds {
            failed_login_window: Duration::hours(1),
            ..recorder.thresholds()
        };
        let alerts = recorder.detect_anomalies_with(narrow, now()).await.unwrap();
        assert!(alerts.is_empty());
    }
}
