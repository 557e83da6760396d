//! Recurring job definitions.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{OrganizationId, ScheduleId, UserId};
use crate::job::{JobPriority, JobType, NewJob};

/// When a schedule fires.
///
/// Serialized externally tagged: `{"interval_seconds": 3600}` or
/// `{"cron": "0 0 * * * *"}` (cron expressions include the seconds field).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleSpec {
    IntervalSeconds(u32),
    Cron(String),
}

impl ScheduleSpec {
    pub fn validate(&self) -> DomainResult<()> {
        match self {
            ScheduleSpec::IntervalSeconds(secs) => {
                if *secs == 0 {
                    return Err(DomainError::validation("interval_seconds must be positive"));
                }
                Ok(())
            }
            ScheduleSpec::Cron(expr) => {
                cron::Schedule::from_str(expr)
                    .map_err(|e| DomainError::validation(format!("invalid cron expression: {e}")))?;
                Ok(())
            }
        }
    }

    /// Next firing instant strictly after `now`.
    ///
    /// Always computed relative to `now`, never to a missed slot, so an
    /// outage does not produce a burst of backlogged catch-up jobs.
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> DomainResult<DateTime<Utc>> {
        match self {
            ScheduleSpec::IntervalSeconds(secs) => {
                Ok(now + chrono::Duration::seconds(i64::from(*secs)))
            }
            ScheduleSpec::Cron(expr) => {
                let schedule = cron::Schedule::from_str(expr)
                    .map_err(|e| DomainError::validation(format!("invalid cron expression: {e}")))?;
                schedule.after(&now).next().ok_or_else(|| {
                    DomainError::validation("cron expression yields no future occurrence")
                })
            }
        }
    }
}

/// A recurring definition that periodically materializes job instances.
///
/// Never auto-deleted; deactivate instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSchedule {
    pub id: ScheduleId,
    pub organization_id: OrganizationId,
    pub created_by: UserId,
    pub name: String,
    pub job_type: JobType,
    /// Payload template copied into each materialized job.
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    pub spec: ScheduleSpec,
    pub next_run_at: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl JobSchedule {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_run_at <= now
    }

    /// Build the job submission for one firing of this schedule.
    pub fn materialize(&self, now: DateTime<Utc>) -> NewJob {
        NewJob::new(
            self.organization_id,
            self.created_by,
            self.job_type.clone(),
            self.name.clone(),
        )
        .with_priority(self.priority)
        .with_payload(self.payload.clone())
        .with_scheduled_at(now)
    }
}

/// A validated schedule submission.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub organization_id: OrganizationId,
    pub created_by: UserId,
    pub name: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    pub spec: ScheduleSpec,
}

impl NewSchedule {
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("name must not be empty"));
        }
        if self.name.len() > 200 {
            return Err(DomainError::validation("name must be at most 200 chars"));
        }
        self.spec.validate()
    }

    /// Materialize the definition, computing its first firing from `now`.
    pub fn into_schedule(self, now: DateTime<Utc>) -> DomainResult<JobSchedule> {
        self.validate()?;
        let next_run_at = self.spec.next_occurrence(now)?;
        Ok(JobSchedule {
            id: ScheduleId::new(),
            organization_id: self.organization_id,
            created_by: self.created_by,
            name: self.name,
            job_type: self.job_type,
            payload: self.payload,
            priority: self.priority,
            spec: self.spec,
            next_run_at,
            is_active: true,
            created_at: now,
            last_run_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_schedule(spec: ScheduleSpec) -> NewSchedule {
        NewSchedule {
            organization_id: OrganizationId::new(),
            created_by: UserId::new(),
            name: "hourly eligibility sweep".to_string(),
            job_type: JobType::new("eligibility.scan").unwrap(),
            payload: serde_json::json!({"full": false}),
            priority: JobPriority::Normal,
            spec,
        }
    }

    #[test]
    fn interval_next_occurrence_is_relative_to_now() {
        let now = Utc::now();
        let spec = ScheduleSpec::IntervalSeconds(3600);
        assert_eq!(
            spec.next_occurrence(now).unwrap(),
            now + chrono::Duration::hours(1)
        );
    }

    #[test]
    fn cron_next_occurrence_is_after_now() {
        let now = Utc::now();
        // top of every hour
        let spec = ScheduleSpec::Cron("0 0 * * * *".to_string());
        let next = spec.next_occurrence(now).unwrap();
        assert!(next > now);
        assert!(next <= now + chrono::Duration::hours(1));
    }

    #[test]
    fn rejects_zero_interval_and_bad_cron() {
        assert!(ScheduleSpec::IntervalSeconds(0).validate().is_err());
        assert!(ScheduleSpec::Cron("not a cron".to_string()).validate().is_err());
        assert!(ScheduleSpec::Cron("0 0 * * * *".to_string()).validate().is_ok());
    }

    #[test]
    fn into_schedule_sets_first_firing() {
        let now = Utc::now();
        let schedule = new_schedule(ScheduleSpec::IntervalSeconds(60))
            .into_schedule(now)
            .unwrap();
        assert!(schedule.is_active);
        assert_eq!(schedule.next_run_at, now + chrono::Duration::seconds(60));
        assert!(!schedule.is_due(now));
        assert!(schedule.is_due(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn materialized_job_copies_the_template() {
        let now = Utc::now();
        let schedule = new_schedule(ScheduleSpec::IntervalSeconds(60))
            .into_schedule(now)
            .unwrap();
        let job = schedule.materialize(now);
        assert_eq!(job.job_type, schedule.job_type);
        assert_eq!(job.payload, schedule.payload);
        assert_eq!(job.scheduled_at, Some(now));
    }

    #[test]
    fn spec_serde_shape() {
        let spec = ScheduleSpec::IntervalSeconds(900);
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json, serde_json::json!({"interval_seconds": 900}));
    }
}
