//! Health state of every observed server
//!
//! Pure state machine, owned by the monitor coordinator. Probe observations
//! go in; the effect the coordinator must act on comes out.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
}

/// Which loop produced an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeSource {
    /// Periodic probe of every server
    Main,
    /// Fast probe of down-set members only
    Rapid,
}

/// What the coordinator must do after an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Server is down; alert unless the cooldown says otherwise
    CheckAlert,
    /// Server left the down-set; tell everyone
    NotifyRecovery,
    None,
}

/// Read-only view published to the rapid loop and the API
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub statuses: BTreeMap<i64, HealthStatus>,
    pub down: BTreeSet<i64>,
}

impl HealthSnapshot {
    /// None until the server has been probed once
    pub fn status_of(&self, server_id: i64) -> Option<HealthStatus> {
        self.statuses.get(&server_id).copied()
    }
}

#[derive(Debug, Default)]
pub struct HealthRegistry {
    statuses: BTreeMap<i64, HealthStatus>,
    down: BTreeSet<i64>,
    alerting: HashSet<i64>,
    recovering: HashSet<i64>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one probe observation
    ///
    /// An unhealthy main probe yields `CheckAlert` every time, not only on the
    /// UP to DOWN edge; the alert cooldown decides whether anything is sent.
    /// An unhealthy rapid probe changes nothing.
    pub fn apply(&mut self, server_id: i64, source: ProbeSource, healthy: bool) -> Effect {
        match (source, healthy) {
            (ProbeSource::Main, false) => {
                self.statuses.insert(server_id, HealthStatus::Down);
                self.down.insert(server_id);
                Effect::CheckAlert
            }
            (ProbeSource::Rapid, false) => Effect::None,
            (_, true) => {
                self.statuses.insert(server_id, HealthStatus::Up);
                if self.down.remove(&server_id) {
                    Effect::NotifyRecovery
                } else {
                    Effect::None
                }
            }
        }
    }

    /// Mark an outage alert in flight; false if one already is
    pub fn begin_alert(&mut self, server_id: i64) -> bool {
        self.alerting.insert(server_id)
    }

    pub fn finish_alert(&mut self, server_id: i64) {
        self.alerting.remove(&server_id);
    }

    pub fn alert_in_flight(&self, server_id: i64) -> bool {
        self.alerting.contains(&server_id)
    }

    pub fn alerts_in_flight(&self) -> usize {
        self.alerting.len()
    }

    /// Mark a recovery notification in flight; false if one already is
    pub fn begin_recovery(&mut self, server_id: i64) -> bool {
        self.recovering.insert(server_id)
    }

    pub fn finish_recovery(&mut self, server_id: i64) {
        self.recovering.remove(&server_id);
    }

    pub fn recovery_in_flight(&self, server_id: i64) -> bool {
        self.recovering.contains(&server_id)
    }

    pub fn recoveries_in_flight(&self) -> usize {
        self.recovering.len()
    }

    /// Drop a server that no longer exists in the directory
    pub fn forget(&mut self, server_id: i64) {
        self.statuses.remove(&server_id);
        self.down.remove(&server_id);
    }

    pub fn is_down(&self, server_id: i64) -> bool {
        self.down.contains(&server_id)
    }

    pub fn down_count(&self) -> usize {
        self.down.len()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            statuses: self.statuses.clone(),
            down: self.down.clone(),
        }
    }
}

/// Whether an alert may be sent given the last one
pub fn alert_due(last: Option<DateTime<Utc>>, now: DateTime<Utc>, cooldown: chrono::Duration) -> bool {
    match last {
        None => true,
        Some(last) => now - last >= cooldown,
    }
}
