//! Dead-letter entries for permanently failed jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{DeadLetterId, JobId, OrganizationId};
use crate::job::JobType;

/// Created exactly once when a job exhausts its retry budget.
///
/// Resolving an entry records the triage outcome; it never resurrects the
/// underlying job (that requires the explicit manual-retry path, which
/// creates a new lineage job).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub job_id: JobId,
    pub organization_id: OrganizationId,
    pub job_type: JobType,
    /// The final error that exhausted the retry budget.
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
}

impl DeadLetterEntry {
    pub fn new(
        job_id: JobId,
        organization_id: OrganizationId,
        job_type: JobType,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeadLetterId::new(),
            job_id,
            organization_id,
            job_type,
            error: error.into(),
            created_at: now,
            resolved: false,
            resolved_at: None,
            resolution_note: None,
        }
    }

    pub fn resolve(&mut self, note: impl Into<String>, now: DateTime<Utc>) {
        self.resolved = true;
        self.resolved_at = Some(now);
        self.resolution_note = Some(note.into());
    }
}
