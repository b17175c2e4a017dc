//! Credential rotation service
//!
//! Quota is a shared, externally-metered resource: rotation is conservative
//! (the soft threshold triggers proactive rotation before a request actually
//! fails) and never hot-loops across an all-exhausted pool. Callers that get
//! `None` back must escalate to a paused/degraded state instead of retrying.
//!
//! This service is the only mutator of the credential records; callers never
//! touch quota fields directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jbx_common::config::JbxConfig;
use jbx_common::model::{CredentialRecord, RotationEvent, RotationReason};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Cheap validity probe for one credential
///
/// The real implementation performs an inexpensive read against the metered
/// API; tests inject canned outcomes.
#[async_trait]
pub trait CredentialProbe: Send + Sync {
    /// True when the service accepts the credential
    async fn probe(&self, credential_id: &str) -> bool;
}

/// Tracks quota per credential and decides which one to hand out
pub struct CredentialRotation {
    records: Vec<CredentialRecord>,
    active: Option<String>,
    events: VecDeque<RotationEvent>,
    soft_quota_percent: f32,
    hard_quota_percent: f32,
    exhaustion_cooldown: chrono::Duration,
    rotation_log_cap: usize,
}

impl CredentialRotation {
    /// Build the pool from the ordered credential list plus the optional
    /// user-supplied custom slot (appended last)
    pub fn new(pool: Vec<String>, custom: Option<String>, config: &JbxConfig) -> Self {
        let mut records: Vec<CredentialRecord> =
            pool.into_iter().map(CredentialRecord::new).collect();
        if let Some(custom) = custom {
            records.push(CredentialRecord::new(custom));
        }

        Self {
            records,
            active: None,
            events: VecDeque::new(),
            soft_quota_percent: config.soft_quota_percent,
            hard_quota_percent: config.hard_quota_percent,
            exhaustion_cooldown: config.exhaustion_cooldown(),
            rotation_log_cap: config.rotation_log_cap,
        }
    }

    fn is_usable(&self, record: &CredentialRecord, now: DateTime<Utc>) -> bool {
        record.quota_used_percent < self.soft_quota_percent && !record.in_cooldown(now)
    }

    /// First credential under the soft threshold and outside its cooldown
    ///
    /// `None` means the whole pool is exhausted or over threshold; callers
    /// must escalate, never spin.
    pub fn usable(&self, now: DateTime<Utc>) -> Option<&CredentialRecord> {
        self.records.iter().find(|r| self.is_usable(r, now))
    }

    /// Credential to use for the next request, rotating proactively
    ///
    /// Keeps the active credential while it stays under the soft threshold;
    /// otherwise switches to the first usable one and logs a RotationEvent.
    pub fn select_active(&mut self, now: DateTime<Utc>) -> Option<CredentialRecord> {
        if let Some(active_id) = self.active.clone() {
            if let Some(record) = self.records.iter().find(|r| r.id == active_id) {
                if self.is_usable(record, now) {
                    return Some(record.clone());
                }
            }
        }

        let next = self.usable(now).cloned();
        match next {
            Some(record) => {
                let from = self.active.replace(record.id.clone());
                // First-ever selection is adoption, not rotation
                if from.is_some() && from.as_deref() != Some(record.id.as_str()) {
                    info!(
                        from = ?from,
                        to = %record.id,
                        "Rotating credentials proactively"
                    );
                    self.push_event(RotationEvent {
                        timestamp: now,
                        from_credential: from,
                        to_credential: Some(record.id.clone()),
                        reason: RotationReason::ThresholdExceeded,
                    });
                }
                Some(record)
            }
            None => {
                warn!("Credential pool exhausted; no usable credential");
                None
            }
        }
    }

    /// Record quota consumption for an attempt
    ///
    /// Unconditional: quota is consumed whether or not the call succeeded.
    pub fn record_usage(&mut self, credential_id: &str, cost_percent: f32) {
        if let Some(record) = self.records.iter_mut().find(|r| r.id == credential_id) {
            record.quota_used_percent = (record.quota_used_percent + cost_percent).min(100.0);
            debug!(
                credential = %credential_id,
                quota = record.quota_used_percent,
                "Usage recorded"
            );
        }
    }

    /// Put a credential into its exhaustion cooldown
    pub fn mark_exhausted(&mut self, credential_id: &str, now: DateTime<Utc>, reason: RotationReason) {
        let until = now + self.exhaustion_cooldown;
        if let Some(record) = self.records.iter_mut().find(|r| r.id == credential_id) {
            record.exhausted_until = Some(until);
            warn!(credential = %credential_id, %until, %reason, "Credential marked exhausted");
        }
        if self.active.as_deref() == Some(credential_id) {
            self.active = None;
        }
        self.push_event(RotationEvent {
            timestamp: now,
            from_credential: Some(credential_id.to_string()),
            to_credential: None,
            reason,
        });
    }

    /// Probe every credential and return the ones both valid and under the
    /// hard limit, sorted by ascending quota usage (prefer least-used)
    pub async fn validate_all(&mut self, probe: &dyn CredentialProbe) -> Vec<CredentialRecord> {
        let now = Utc::now();
        let mut validated = Vec::new();

        for record in &mut self.records {
            if !plausible_credential(&record.id) {
                debug!(credential = %record.id, "Credential fails format check");
                continue;
            }
            if record.quota_used_percent >= self.hard_quota_percent {
                debug!(credential = %record.id, "Credential over hard quota limit");
                continue;
            }
            if probe.probe(&record.id).await {
                record.last_validated_at = Some(now);
                validated.push(record.clone());
            } else {
                debug!(credential = %record.id, "Credential rejected by probe");
            }
        }

        validated.sort_by(|a, b| {
            a.quota_used_percent
                .partial_cmp(&b.quota_used_percent)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        validated
    }

    /// Most-recent rotation events, newest last (display only)
    pub fn recent_events(&self) -> impl Iterator<Item = &RotationEvent> {
        self.events.iter()
    }

    pub fn records(&self) -> &[CredentialRecord] {
        &self.records
    }

    fn push_event(&mut self, event: RotationEvent) {
        self.events.push_back(event);
        while self.events.len() > self.rotation_log_cap {
            self.events.pop_front();
        }
    }
}

/// Basic format plausibility check, cheap enough to run on every validation
fn plausible_credential(id: &str) -> bool {
    id.len() >= 16 && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
