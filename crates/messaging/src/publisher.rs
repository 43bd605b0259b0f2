//! Publishes recorded phase transitions to the broker, once each.

use kiln_core::{AmqpConfig, ImageBuild, MessagingConfig, PhaseTransition, ReferenceError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{BrokerError, MessageBroker, PublishOptions, Publisher};
use crate::message::{build_object_link, LinkError, StatusTransitionMessage};
use crate::store::{ObjectStore, PatchOperation, StoreError};

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("messaging is enabled but no broker is configured")]
    NotConfigured,

    #[error("failed to connect to broker: {0}")]
    Connect(#[source] BrokerError),

    #[error("failed to build object link: {0}")]
    ObjectLink(#[from] LinkError),

    #[error("parsing image name {image:?} failed: {source}")]
    ParseImage {
        image: String,
        #[source]
        source: ReferenceError,
    },

    #[error("failed to marshal status message: {0}")]
    Marshal(#[source] serde_json::Error),

    #[error("failed to publish transition {index}: {source}")]
    Publish {
        index: usize,
        #[source]
        source: BrokerError,
    },

    #[error("failed to generate status patch: {0}")]
    GeneratePatch(#[source] serde_json::Error),

    #[error("failed to apply status patch: {0}")]
    ApplyPatch(#[source] StoreError),
}

/// Broker routing for one reconciliation, after object overrides are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Route {
    exchange: String,
    queue: String,
}

impl Route {
    fn resolve(amqp: &AmqpConfig, object: &ImageBuild) -> Self {
        let mut route = Self {
            exchange: amqp.exchange.clone(),
            queue: amqp.queue.clone(),
        };

        if let Some(overrides) = &object.spec.amqp_overrides {
            if !overrides.exchange_name.is_empty() {
                route.exchange = overrides.exchange_name.clone();
            }
            if !overrides.queue_name.is_empty() {
                route.queue = overrides.queue_name.clone();
            }
        }
        route
    }
}

/// Drives an `ImageBuild`'s transition log out to the broker.
///
/// Each unprocessed transition is published, then marked processed and persisted
/// with a patch addressing only that entry. Processing stops at the first error;
/// the next call resumes at the first transition still unprocessed. Callers must
/// not reconcile the same object concurrently.
pub struct StatusMessenger {
    config: MessagingConfig,
    broker: Arc<dyn MessageBroker>,
    store: Arc<dyn ObjectStore>,
}

impl StatusMessenger {
    pub fn new(
        config: MessagingConfig,
        broker: Arc<dyn MessageBroker>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            broker,
            store,
        }
    }

    #[instrument(skip(self, object), fields(imagebuild = %object.object_key()))]
    pub async fn reconcile(&self, object: &mut ImageBuild) -> Result<(), MessengerError> {
        if !self.config.enabled {
            debug!("Messaging disabled, skipping");
            return Ok(());
        }

        let pending = object.status.transitions.iter().filter(|t| !t.processed).count();
        if pending == 0 {
            debug!("No pending transitions");
            return Ok(());
        }

        let amqp = match self.config.amqp.as_ref() {
            Some(amqp) => amqp,
            None => {
                let e = MessengerError::NotConfigured;
                error!(error = %e, class = "config", "Cannot publish transitions");
                return Err(e);
            }
        };
        let route = Route::resolve(amqp, object);
        info!(
            pending,
            exchange = %route.exchange,
            queue = %route.queue,
            "Publishing pending transitions"
        );

        let mut publisher = self.broker.connect(&amqp.url).await.map_err(|e| {
            error!(error = %e, class = "connect", url = %amqp.url, "Failed to connect to broker");
            MessengerError::Connect(e)
        })?;

        let result = self.publish_pending(object, &route, publisher.as_mut()).await;

        if let Err(e) = publisher.close().await {
            warn!(error = %e, "Failed to close broker connection");
        }

        result
    }

    async fn publish_pending(
        &self,
        object: &mut ImageBuild,
        route: &Route,
        publisher: &mut dyn Publisher,
    ) -> Result<(), MessengerError> {
        for index in 0..object.status.transitions.len() {
            if object.status.transitions[index].processed {
                continue;
            }
            self.publish_transition(object, index, route, &mut *publisher)
                .await?;
        }

        Ok(())
    }

    /// Publishes transition `index`, persists it as processed, then marks it in memory.
    #[instrument(
        skip(self, object, route, publisher),
        fields(phase = %object.status.transitions[index].phase)
    )]
    async fn publish_transition(
        &self,
        object: &mut ImageBuild,
        index: usize,
        route: &Route,
        publisher: &mut dyn Publisher,
    ) -> Result<(), MessengerError> {
        debug!("Processing phase transition");

        let message = build_object_link(object)
            .map_err(MessengerError::from)
            .and_then(|link| {
                StatusTransitionMessage::new(object, link, &object.status.transitions[index])
            })
            .map_err(|e| {
                error!(error = %e, class = "message", "Failed to build status message");
                e
            })?;
        let body = serde_json::to_vec(&message).map_err(|e| {
            error!(error = %e, class = "marshal", "Failed to marshal status message");
            MessengerError::Marshal(e)
        })?;

        debug!(bytes = body.len(), "Publishing transition message");
        publisher
            .publish(PublishOptions {
                exchange_name: &route.exchange,
                queue_name: &route.queue,
                content_type: CONTENT_TYPE_JSON,
                body: &body,
            })
            .await
            .map_err(|source| {
                error!(error = %source, class = "publish", "Failed to publish transition");
                MessengerError::Publish { index, source }
            })?;

        info!(
            previous_phase = %message.previous_phase,
            current_phase = %message.current_phase,
            "Published transition"
        );

        let mut processed = object.status.transitions[index].clone();
        processed.processed = true;
        self.persist_processed(object, index, &processed).await?;
        object.status.transitions[index] = processed;

        Ok(())
    }

    async fn persist_processed(
        &self,
        object: &ImageBuild,
        index: usize,
        transition: &PhaseTransition,
    ) -> Result<(), MessengerError> {
        debug!("Patching processed status transition");

        let patch = serde_json::to_value(transition)
            .and_then(|value| {
                serde_json::to_vec(&[PatchOperation::replace(
                    format!("/status/transitions/{}", index),
                    value,
                )])
            })
            .map_err(|e| {
                error!(error = %e, class = "patch", "Failed to generate status patch");
                MessengerError::GeneratePatch(e)
            })?;

        self.store.patch_status(object, &patch).await.map_err(|e| {
            error!(error = %e, class = "patch", "Failed to apply status patch");
            MessengerError::ApplyPatch(e)
        })?;

        Ok(())
    }
}
