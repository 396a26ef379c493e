//! Operator maintenance: integrity checks, dry-run scans, projection
//! comparison and rebuilds.
//!
//! Everything here does blocking file I/O. From async code, go through
//! the [`CampaignStore`](crate::CampaignStore) wrappers or
//! `tokio::task::spawn_blocking`.

use std::sync::Arc;

use crate::aggregate::AggregateState;
use crate::error::MaintenanceError;
use crate::integrity::IntegrityReport;
use crate::journal::Journal;
use crate::outbox::{Outbox, OutboxStatus};
use crate::projection::{Projection, ProjectionApplier, ProjectionStore};
use crate::registry::Registry;
use crate::replay::{REPLAY_CONSUMER, ReplayReport, ReplayRequest, ReplayRunner};
use crate::store::Quarantines;

/// One problem found by [`Maintenance::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanIssue {
    pub seq: u64,
    pub event_type: String,
    pub problem: String,
}

/// Result of a dry-run walk over a campaign's journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub campaign_id: String,
    pub events: u64,
    pub issues: Vec<ScanIssue>,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Per-campaign line of [`Maintenance::report_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignReport {
    pub campaign_id: String,
    pub integrity: IntegrityReport,
    /// `last_seq` of the stored projection.
    pub projection_seq: u64,
    /// `None` when the comparison could not run.
    pub projection_in_sync: Option<bool>,
    pub scan_issues: usize,
    pub outbox_pending: usize,
    pub outbox_dead: usize,
    /// First error that stopped part of the report.
    pub error: Option<String>,
}

/// Maintenance tasks over one store's journal and projection.
pub struct Maintenance<S, P> {
    journal: Arc<Journal>,
    registry: Arc<Registry<S>>,
    applier: Arc<ProjectionApplier<P>>,
    projections: Arc<ProjectionStore<P>>,
    outbox: Arc<Outbox>,
    replay: Arc<ReplayRunner<S, P>>,
    quarantines: Quarantines,
    page_size: usize,
}

impl<S: AggregateState, P: Projection> Maintenance<S, P> {
    pub fn new(
        journal: Arc<Journal>,
        registry: Arc<Registry<S>>,
        applier: Arc<ProjectionApplier<P>>,
        projections: Arc<ProjectionStore<P>>,
        outbox: Arc<Outbox>,
        replay: Arc<ReplayRunner<S, P>>,
    ) -> Self {
        Self {
            journal,
            registry,
            applier,
            projections,
            outbox,
            replay,
            quarantines: Quarantines::default(),
            page_size: 256,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub(crate) fn with_quarantines(mut self, quarantines: Quarantines) -> Self {
        self.quarantines = quarantines;
        self
    }

    /// Projection writes are refused while the campaign is quarantined.
    fn check_writable(&self, campaign_id: &str) -> Result<(), MaintenanceError> {
        match self.quarantines.get(campaign_id) {
            Some(q) => Err(MaintenanceError::Integrity {
                campaign_id: campaign_id.to_owned(),
                at_seq: q.at_seq,
                reason: q.reason,
            }),
            None => Ok(()),
        }
    }

    /// Walk the chain and signatures of one campaign. Returns the number of
    /// verified events.
    ///
    /// # Errors
    ///
    /// [`MaintenanceError::Integrity`] names the first seq that failed.
    pub fn verify(&self, campaign_id: &str) -> Result<u64, MaintenanceError> {
        match self.journal.verify_integrity(campaign_id)? {
            IntegrityReport::Ok { events } => Ok(events),
            IntegrityReport::Corrupted { at_seq, reason } => Err(MaintenanceError::Integrity {
                campaign_id: campaign_id.to_owned(),
                at_seq,
                reason,
            }),
        }
    }

    /// Check every stored event against the current registry and handler
    /// tables without writing anything.
    ///
    /// Finds events whose type is no longer registered, whose intent or
    /// owner changed, whose payload no longer validates, and must-apply
    /// events the projection cannot route.
    pub fn scan(&self, campaign_id: &str) -> Result<ScanReport, MaintenanceError> {
        let mut report = ScanReport {
            campaign_id: campaign_id.to_owned(),
            events: 0,
            issues: Vec::new(),
        };
        let mut after = 0;
        loop {
            let page = self.journal.list_events(campaign_id, after, self.page_size)?;
            let Some(last) = page.last() else { break };
            after = last.seq;
            for event in &page {
                report.events += 1;
                if event.seq != report.events {
                    report.issues.push(ScanIssue {
                        seq: event.seq,
                        event_type: event.event_type.clone(),
                        problem: format!("expected seq {}", report.events),
                    });
                }
                if let Err(e) = self.registry.check_stored(event) {
                    report.issues.push(ScanIssue {
                        seq: event.seq,
                        event_type: event.event_type.clone(),
                        problem: e.to_string(),
                    });
                }
                if let Err(e) = self.applier.check_route(event) {
                    report.issues.push(ScanIssue {
                        seq: event.seq,
                        event_type: event.event_type.clone(),
                        problem: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            campaign_id = %campaign_id,
            events = report.events,
            issues = report.issues.len(),
            "journal scan finished"
        );
        Ok(report)
    }

    /// Compare the stored projection with a scratch replay up to the same
    /// seq. Returns the compared seq.
    ///
    /// # Errors
    ///
    /// [`MaintenanceError::ProjectionMismatch`] when they differ.
    pub fn check_projection(&self, campaign_id: &str) -> Result<u64, MaintenanceError> {
        let stored = self.projections.load(campaign_id)?;
        let (replayed, replayed_seq) = self.replay.scratch(campaign_id, Some(stored.last_seq))?;
        if replayed_seq != stored.last_seq || replayed != stored.state {
            return Err(MaintenanceError::ProjectionMismatch {
                campaign_id: campaign_id.to_owned(),
                projection: P::NAME,
                stored_seq: stored.last_seq,
                replayed_seq,
            });
        }
        Ok(stored.last_seq)
    }

    /// Replay `(after_seq, until_seq]` into the live projection. Events the
    /// projection already reflects are skipped by its watermark.
    pub fn replay_window(
        &self,
        campaign_id: &str,
        after_seq: u64,
        until_seq: Option<u64>,
    ) -> Result<ReplayReport, MaintenanceError> {
        self.check_writable(campaign_id)?;
        let request = ReplayRequest::projection(REPLAY_CONSUMER).window(after_seq, until_seq);
        Ok(self.replay.run(campaign_id, &request)?)
    }

    /// Discard the projection and rebuild it from the whole journal.
    pub fn rebuild(&self, campaign_id: &str) -> Result<ReplayReport, MaintenanceError> {
        self.check_writable(campaign_id)?;
        Ok(self.replay.rebuild(campaign_id)?)
    }

    /// Verify, scan and compare every campaign in the store.
    ///
    /// A failure in one campaign is recorded in its report line and does
    /// not stop the batch.
    pub fn report_all(&self) -> Result<Vec<CampaignReport>, MaintenanceError> {
        let campaigns = self.journal.list_campaigns()?;
        let mut reports = Vec::with_capacity(campaigns.len());
        for campaign_id in campaigns {
            reports.push(self.report(&campaign_id));
        }
        let corrupted = reports.iter().filter(|r| !r.integrity.is_ok()).count();
        tracing::info!(campaigns = reports.len(), corrupted, "maintenance report finished");
        Ok(reports)
    }

    fn report(&self, campaign_id: &str) -> CampaignReport {
        let (mut outbox_pending, mut outbox_dead) = (0, 0);
        for item in self.outbox.list(None).into_iter().filter(|i| i.campaign_id == campaign_id) {
            match item.status {
                OutboxStatus::Dead => outbox_dead += 1,
                _ => outbox_pending += 1,
            }
        }
        let mut report = CampaignReport {
            campaign_id: campaign_id.to_owned(),
            integrity: IntegrityReport::Ok { events: 0 },
            projection_seq: 0,
            projection_in_sync: None,
            scan_issues: 0,
            outbox_pending,
            outbox_dead,
            error: None,
        };

        match self.journal.verify_integrity(campaign_id) {
            Ok(integrity) => report.integrity = integrity,
            Err(e) => {
                report.error = Some(e.to_string());
                return report;
            }
        }
        if !report.integrity.is_ok() {
            return report;
        }

        match self.scan(campaign_id) {
            Ok(scan) => report.scan_issues = scan.issues.len(),
            Err(e) => report.error = Some(e.to_string()),
        }
        match self.projections.load(campaign_id) {
            Ok(doc) => report.projection_seq = doc.last_seq,
            Err(e) => {
                report.error.get_or_insert(e.to_string());
                return report;
            }
        }
        match self.check_projection(campaign_id) {
            Ok(_) => report.projection_in_sync = Some(true),
            Err(MaintenanceError::ProjectionMismatch { .. }) => report.projection_in_sync = Some(false),
            Err(e) => {
                report.error.get_or_insert(e.to_string());
            }
        }
        report
    }
}
