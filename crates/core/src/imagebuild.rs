//! `ImageBuild` resource model as persisted by the controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const API_GROUP: &str = "kiln.dev";
pub const API_VERSION: &str = "v1";
pub const KIND: &str = "ImageBuild";

/// Lifecycle phase of an image build. The empty phase precedes the first transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    #[serde(rename = "")]
    Unset,
    Initializing,
    Running,
    Succeeded,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Unset => "",
            Phase::Initializing => "Initializing",
            Phase::Running => "Running",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Per-object broker routing overrides. Blank fields fall back to the global configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmqpOverrides {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub exchange_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub queue_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuildSpec {
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_args: Vec<String>,
    #[serde(default)]
    pub disable_cache_export: bool,
    #[serde(default)]
    pub disable_cache_import: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amqp_overrides: Option<AmqpOverrides>,
}

/// A recorded phase change. `processed` flips to true once the transition has been
/// published and the flag persisted; it never reverts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTransition {
    #[serde(default)]
    pub previous_phase: Phase,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed: bool,
}

impl PhaseTransition {
    pub fn new(previous_phase: Phase, phase: Phase, occurred_at: DateTime<Utc>) -> Self {
        Self {
            previous_phase,
            phase,
            occurred_at: Some(occurred_at),
            processed: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuildStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub transitions: Vec<PhaseTransition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuild {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ImageBuildSpec,
    #[serde(default)]
    pub status: ImageBuildStatus,
}

impl ImageBuild {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                annotations: BTreeMap::new(),
            },
            ..Default::default()
        }
    }

    /// `namespace/name`, used in log fields.
    pub fn object_key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }

    /// Appends a transition from the current phase and moves the object to `phase`.
    pub fn transition_to(&mut self, phase: Phase, occurred_at: DateTime<Utc>) {
        let previous = self.status.phase;
        self.status
            .transitions
            .push(PhaseTransition::new(previous, phase, occurred_at));
        self.status.phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_serialization() {
        assert_eq!(serde_json::to_string(&Phase::Unset).unwrap(), "\"\"");
        assert_eq!(
            serde_json::to_string(&Phase::Succeeded).unwrap(),
            "\"Succeeded\""
        );
        let phase: Phase = serde_json::from_str("\"Running\"").unwrap();
        assert_eq!(phase, Phase::Running);
    }

    #[test]
    fn test_transition_to_records_previous_phase() {
        let mut build = ImageBuild::new("builds", "app");
        let now = Utc::now();

        build.transition_to(Phase::Initializing, now);
        build.transition_to(Phase::Running, now);

        let transitions = &build.status.transitions;
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].previous_phase, Phase::Unset);
        assert_eq!(transitions[1].previous_phase, Phase::Initializing);
        assert_eq!(transitions[1].phase, Phase::Running);
        assert!(transitions.iter().all(|t| !t.processed));
        assert_eq!(build.status.phase, Phase::Running);
    }

    #[test]
    fn test_deserialize_document() {
        let doc = r#"{
            "metadata": {"name": "app", "namespace": "builds", "annotations": {"team": "ml"}},
            "spec": {
                "images": ["myrepo/app"],
                "amqpOverrides": {"queueName": "custom"}
            },
            "status": {
                "phase": "Running",
                "transitions": [
                    {"previousPhase": "", "phase": "Initializing", "occurredAt": "2024-01-02T03:04:05Z", "processed": true},
                    {"previousPhase": "Initializing", "phase": "Running"}
                ]
            }
        }"#;

        let build: ImageBuild = serde_json::from_str(doc).unwrap();

        assert_eq!(build.object_key(), "builds/app");
        assert_eq!(build.metadata.annotations["team"], "ml");
        let overrides = build.spec.amqp_overrides.unwrap();
        assert_eq!(overrides.queue_name, "custom");
        assert!(overrides.exchange_name.is_empty());
        assert!(build.status.transitions[0].processed);
        assert!(!build.status.transitions[1].processed);
        assert!(build.status.transitions[1].occurred_at.is_none());
    }
}
