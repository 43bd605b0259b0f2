//! Status transition notifications and object links.

use chrono::{DateTime, SecondsFormat, Utc};
use kiln_core::imagebuild::{API_GROUP, API_VERSION, KIND};
use kiln_core::{normalize_image, ImageBuild, Phase, PhaseTransition};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::publisher::MessengerError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("object has no name")]
    MissingName,

    #[error("object {0:?} has no namespace")]
    MissingNamespace(String),
}

/// API path of an `ImageBuild`, e.g. `/apis/kiln.dev/v1/namespaces/builds/imagebuild/app`.
pub fn build_object_link(object: &ImageBuild) -> Result<String, LinkError> {
    let meta = &object.metadata;
    if meta.name.trim().is_empty() {
        return Err(LinkError::MissingName);
    }
    if meta.namespace.trim().is_empty() {
        return Err(LinkError::MissingNamespace(meta.name.clone()));
    }

    Ok(format!(
        "/apis/{}/{}/namespaces/{}/{}/{}",
        API_GROUP,
        API_VERSION,
        meta.namespace,
        KIND.to_lowercase(),
        meta.name
    ))
}

/// Outbound notification for one phase transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTransitionMessage {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    pub object_link: String,
    pub previous_phase: Phase,
    pub current_phase: Phase,
    #[serde(serialize_with = "rfc3339")]
    pub occurred_at: DateTime<Utc>,
    #[serde(rename = "imageURLs", skip_serializing_if = "Option::is_none")]
    pub image_urls: Option<Vec<String>>,
}

fn rfc3339<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Secs, true))
}

impl StatusTransitionMessage {
    /// Builds the message for `transition`. Image URLs are attached only for
    /// `Succeeded`, each normalized with a default tag.
    pub fn new(
        object: &ImageBuild,
        object_link: String,
        transition: &PhaseTransition,
    ) -> Result<Self, MessengerError> {
        let image_urls = if transition.phase == Phase::Succeeded {
            let urls = object
                .spec
                .images
                .iter()
                .map(|image| {
                    normalize_image(image).map_err(|source| MessengerError::ParseImage {
                        image: image.clone(),
                        source,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Some(urls)
        } else {
            None
        };

        Ok(Self {
            name: object.metadata.name.clone(),
            annotations: object.metadata.annotations.clone(),
            object_link,
            previous_phase: transition.previous_phase,
            current_phase: transition.phase,
            occurred_at: transition.occurred_at.unwrap_or_else(Utc::now),
            image_urls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn build_with_images(images: &[&str]) -> ImageBuild {
        let mut build = ImageBuild::new("builds", "app");
        build.spec.images = images.iter().map(|s| s.to_string()).collect();
        build
            .metadata
            .annotations
            .insert("team".to_string(), "platform".to_string());
        build
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap()
    }

    #[test]
    fn test_object_link() {
        let build = ImageBuild::new("builds", "app");
        assert_eq!(
            build_object_link(&build).unwrap(),
            "/apis/kiln.dev/v1/namespaces/builds/imagebuild/app"
        );
    }

    #[test]
    fn test_object_link_requires_identity() {
        assert_eq!(
            build_object_link(&ImageBuild::new("builds", "")),
            Err(LinkError::MissingName)
        );
        assert_eq!(
            build_object_link(&ImageBuild::new("", "app")),
            Err(LinkError::MissingNamespace("app".to_string()))
        );
    }

    #[test]
    fn test_succeeded_message_carries_image_urls() {
        let build = build_with_images(&["myrepo/app", "myrepo/app:v2"]);
        let transition = PhaseTransition::new(Phase::Running, Phase::Succeeded, at());

        let message =
            StatusTransitionMessage::new(&build, "/link".to_string(), &transition).unwrap();

        assert_eq!(
            message.image_urls,
            Some(vec!["myrepo/app:latest".to_string(), "myrepo/app:v2".to_string()])
        );
    }

    #[test]
    fn test_wire_format() {
        let build = build_with_images(&["myrepo/app"]);
        let transition = PhaseTransition::new(Phase::Initializing, Phase::Running, at());

        let message =
            StatusTransitionMessage::new(&build, "/link".to_string(), &transition).unwrap();
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "name": "app",
                "annotations": {"team": "platform"},
                "objectLink": "/link",
                "previousPhase": "Initializing",
                "currentPhase": "Running",
                "occurredAt": "2024-05-06T07:08:09Z"
            })
        );
    }

    #[test]
    fn test_succeeded_wire_key() {
        let build = build_with_images(&["myrepo/app"]);
        let transition = PhaseTransition::new(Phase::Running, Phase::Succeeded, at());

        let message =
            StatusTransitionMessage::new(&build, "/link".to_string(), &transition).unwrap();
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["imageURLs"], serde_json::json!(["myrepo/app:latest"]));
    }

    #[test]
    fn test_malformed_image_is_reported() {
        let build = build_with_images(&["myrepo/app", "Not Valid"]);
        let transition = PhaseTransition::new(Phase::Running, Phase::Succeeded, at());

        let err = StatusTransitionMessage::new(&build, "/link".to_string(), &transition)
            .unwrap_err();
        assert!(matches!(err, MessengerError::ParseImage { ref image, .. } if image == "Not Valid"));
        assert!(err.to_string().starts_with("parsing image name \"Not Valid\" failed"));
    }

    #[test]
    fn test_missing_occurred_at_defaults_to_now() {
        let build = build_with_images(&[]);
        let transition = PhaseTransition {
            occurred_at: None,
            ..PhaseTransition::new(Phase::Unset, Phase::Initializing, at())
        };

        let before = Utc::now();
        let message =
            StatusTransitionMessage::new(&build, "/link".to_string(), &transition).unwrap();
        assert!(message.occurred_at >= before);
    }
}
