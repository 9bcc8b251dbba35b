use chrono::{DateTime, Utc};
use vpn_fleet_core::{
    peers::manager::SyncOutcome,
    resources::crd::v1alpha1::{
        conditions::{
            find_condition, merge_conditions, Condition, ConditionStatus, CONDITION_AVAILABLE,
            CONDITION_DEGRADED, CONDITION_PROGRESSING,
        },
        vpnserver::VPNServerStatus,
    },
};

use super::error::ReconcilerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Telemetry {
    pub connected_clients: u32,
    pub total_traffic: u64,
}

impl From<&SyncOutcome> for Telemetry {
    fn from(outcome: &SyncOutcome) -> Self {
        Self {
            connected_clients: outcome.connected_clients,
            total_traffic: outcome.total_traffic,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum PeerSync {
    /// no ready instance to apply peers to
    #[default]
    Skipped,
    Clean(Telemetry),
    Failed {
        telemetry: Option<Telemetry>,
        reason: &'static str,
        message: String,
        /// the retry budget is used up, the failure is reported as Degraded
        exhausted: bool,
    },
}

/// State of a server as seen at the end of a reconcile pass.
#[derive(Debug, Clone, Default)]
pub struct ServerObservation {
    pub generation: Option<i64>,
    pub desired: i32,
    pub replicas: i32,
    pub ready: i32,
    pub available: i32,
    /// instances were created or removed during the pass
    pub scaled: bool,
    pub public_key: String,
    pub endpoint: Option<String>,
    pub peer_sync: PeerSync,
}

impl ServerObservation {
    fn is_scaling(&self) -> bool {
        self.scaled || self.replicas != self.desired
    }
}

/// Next status of a server. Sets at most one of Available and Degraded, an unfinished
/// peer sync keeps whatever the previous pass decided.
pub fn desired_status(
    previous: Option<&VPNServerStatus>,
    observation: &ServerObservation,
    now: DateTime<Utc>,
) -> VPNServerStatus {
    let previous_conditions = previous
        .map(|status| status.conditions.as_slice())
        .unwrap_or_default();
    let ready = observation.ready;
    let desired = observation.desired;

    let progressing = if observation.is_scaling() {
        Condition::new(
            CONDITION_PROGRESSING,
            ConditionStatus::True,
            "Scaling",
            format!("Scaling to {desired} replica(s)"),
            now,
        )
    } else if ready < desired {
        Condition::new(
            CONDITION_PROGRESSING,
            ConditionStatus::True,
            "WaitingForReplicas",
            format!("{ready} of {desired} replica(s) ready"),
            now,
        )
    } else if matches!(observation.peer_sync, PeerSync::Failed { exhausted: false, .. }) {
        Condition::new(
            CONDITION_PROGRESSING,
            ConditionStatus::True,
            "PeerSyncRetrying",
            "Retrying the peer sync",
            now,
        )
    } else {
        Condition::new(
            CONDITION_PROGRESSING,
            ConditionStatus::False,
            "Converged",
            "",
            now,
        )
    };

    let (available, degraded) = match &observation.peer_sync {
        PeerSync::Failed {
            reason,
            message,
            exhausted: true,
            ..
        } => (
            Condition::new(
                CONDITION_AVAILABLE,
                ConditionStatus::False,
                "Degraded",
                "",
                now,
            ),
            Condition::new(
                CONDITION_DEGRADED,
                ConditionStatus::True,
                *reason,
                message.to_owned(),
                now,
            ),
        ),
        PeerSync::Failed { .. } => (
            find_condition(previous_conditions, CONDITION_AVAILABLE)
                .cloned()
                .unwrap_or_else(|| {
                    Condition::new(
                        CONDITION_AVAILABLE,
                        ConditionStatus::False,
                        "PeerSyncPending",
                        "",
                        now,
                    )
                }),
            find_condition(previous_conditions, CONDITION_DEGRADED)
                .cloned()
                .unwrap_or_else(|| healthy(now)),
        ),
        _ if ready > 0 => (
            Condition::new(
                CONDITION_AVAILABLE,
                ConditionStatus::True,
                "MinimumReplicasReady",
                format!("{ready} replica(s) ready"),
                now,
            ),
            healthy(now),
        ),
        _ => (
            Condition::new(
                CONDITION_AVAILABLE,
                ConditionStatus::False,
                "NoReadyReplicas",
                "",
                now,
            ),
            healthy(now),
        ),
    };

    let telemetry = match &observation.peer_sync {
        PeerSync::Clean(telemetry)
        | PeerSync::Failed {
            telemetry: Some(telemetry),
            ..
        } => Some(*telemetry),
        _ => None,
    };
    let (connected_clients, total_traffic) = match telemetry {
        Some(telemetry) => (
            Some(i32::try_from(telemetry.connected_clients).unwrap_or(i32::MAX)),
            Some(i64::try_from(telemetry.total_traffic).unwrap_or(i64::MAX)),
        ),
        None => (
            previous.and_then(|status| status.connected_clients),
            previous.and_then(|status| status.total_traffic),
        ),
    };

    VPNServerStatus {
        replicas: observation.replicas,
        ready_replicas: ready,
        available_replicas: observation.available,
        conditions: merge_conditions(previous_conditions, vec![progressing, available, degraded]),
        public_key: Some(observation.public_key.to_owned()),
        endpoint: observation.endpoint.to_owned(),
        connected_clients,
        total_traffic,
        observed_generation: observation.generation,
    }
}

/// Status of a server whose reconciliation gave up. Counters of the previous pass stay.
pub fn degraded_status(
    previous: Option<&VPNServerStatus>,
    generation: Option<i64>,
    error: &ReconcilerError,
    now: DateTime<Utc>,
) -> VPNServerStatus {
    let previous = previous.cloned().unwrap_or_default();
    let conditions = vec![
        Condition::new(
            CONDITION_PROGRESSING,
            ConditionStatus::False,
            "RetriesExhausted",
            "",
            now,
        ),
        Condition::new(
            CONDITION_AVAILABLE,
            ConditionStatus::False,
            "Degraded",
            "",
            now,
        ),
        Condition::new(
            CONDITION_DEGRADED,
            ConditionStatus::True,
            error.reason(),
            error.to_string(),
            now,
        ),
    ];

    VPNServerStatus {
        conditions: merge_conditions(&previous.conditions, conditions),
        observed_generation: generation,
        ..previous
    }
}

fn healthy(now: DateTime<Utc>) -> Condition {
    Condition::new(
        CONDITION_DEGRADED,
        ConditionStatus::False,
        "AsExpected",
        "",
        now,
    )
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use vpn_fleet_core::resources::crd::v1alpha1::{
        conditions::{find_condition, CONDITION_AVAILABLE, CONDITION_DEGRADED, CONDITION_PROGRESSING},
        vpnserver::{SpecValidationError, VPNServerStatus},
    };

    use crate::controller::reconciler::error::ReconcilerError;

    use super::{degraded_status, desired_status, PeerSync, ServerObservation, Telemetry};

    fn converged(ready: i32) -> ServerObservation {
        ServerObservation {
            generation: Some(1),
            desired: 1,
            replicas: 1,
            ready,
            available: ready,
            public_key: "key".to_owned(),
            peer_sync: PeerSync::Clean(Telemetry {
                connected_clients: 2,
                total_traffic: 4096,
            }),
            ..Default::default()
        }
    }

    fn is_true(status: &VPNServerStatus, type_: &str) -> bool {
        find_condition(&status.conditions, type_)
            .map(|condition| condition.is_true())
            .unwrap_or(false)
    }

    #[test]
    fn ready_server_is_available() {
        let status = desired_status(None, &converged(1), Utc::now());

        assert!(is_true(&status, CONDITION_AVAILABLE));
        assert!(!is_true(&status, CONDITION_DEGRADED));
        assert!(!is_true(&status, CONDITION_PROGRESSING));
        assert_eq!(status.connected_clients, Some(2));
        assert_eq!(status.total_traffic, Some(4096));
    }

    #[test]
    fn scaling_keeps_availability() {
        let available = desired_status(None, &converged(1), Utc::now());
        let scaling = ServerObservation {
            desired: 3,
            scaled: true,
            ..converged(1)
        };

        let status = desired_status(Some(&available), &scaling, Utc::now());

        assert!(is_true(&status, CONDITION_PROGRESSING));
        assert!(is_true(&status, CONDITION_AVAILABLE));
        assert!(!is_true(&status, CONDITION_DEGRADED));
    }

    #[test]
    fn unfinished_sync_keeps_the_previous_verdict() {
        let then = Utc::now() - Duration::minutes(5);
        let available = desired_status(None, &converged(1), then);
        let retrying = ServerObservation {
            peer_sync: PeerSync::Failed {
                telemetry: None,
                reason: "InterfaceSyncFailed",
                message: "1 peer(s) couldn't be applied".to_owned(),
                exhausted: false,
            },
            ..converged(1)
        };

        let status = desired_status(Some(&available), &retrying, Utc::now());
        let condition = find_condition(&status.conditions, CONDITION_AVAILABLE).unwrap();

        assert!(condition.is_true());
        assert_eq!(condition.last_transition_time, then);
        assert!(is_true(&status, CONDITION_PROGRESSING));
        assert_eq!(status.connected_clients, Some(2));
    }

    #[test]
    fn exhausted_sync_is_degraded() {
        let failing = ServerObservation {
            peer_sync: PeerSync::Failed {
                telemetry: None,
                reason: "InterfaceSyncFailed",
                message: "1 peer(s) couldn't be applied".to_owned(),
                exhausted: true,
            },
            ..converged(1)
        };

        let status = desired_status(None, &failing, Utc::now());
        let degraded = find_condition(&status.conditions, CONDITION_DEGRADED).unwrap();

        assert!(degraded.is_true());
        assert_eq!(degraded.reason, "InterfaceSyncFailed");
        assert!(!is_true(&status, CONDITION_AVAILABLE));
    }

    #[test]
    fn no_ready_replicas_is_neither_available_nor_degraded() {
        let status = desired_status(None, &converged(0), Utc::now());

        assert!(!is_true(&status, CONDITION_AVAILABLE));
        assert!(!is_true(&status, CONDITION_DEGRADED));
        assert!(is_true(&status, CONDITION_PROGRESSING));
    }

    #[test]
    fn same_observation_gives_the_same_status() {
        let first = desired_status(None, &converged(1), Utc::now() - Duration::minutes(1));
        let second = desired_status(Some(&first), &converged(1), Utc::now());

        assert_eq!(first, second);
    }

    #[test]
    fn degraded_status_keeps_counters() {
        let available = desired_status(None, &converged(1), Utc::now());
        let error = ReconcilerError::from(SpecValidationError::ReplicasOutOfRange(0));

        let status = degraded_status(Some(&available), Some(2), &error, Utc::now());
        let degraded = find_condition(&status.conditions, CONDITION_DEGRADED).unwrap();

        assert!(degraded.is_true());
        assert_eq!(degraded.reason, "InvalidSpec");
        assert!(!is_true(&status, CONDITION_AVAILABLE));
        assert_eq!(status.ready_replicas, 1);
        assert_eq!(status.observed_generation, Some(2));
    }
}
