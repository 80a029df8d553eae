//! # Command Gateways
//!
//! Compose domain commands, check them against their template and put them
//! on the broker. Every gateway runs the same pipeline:
//!
//! ```text
//! template example ──► fill fields ──► substitute {{vars}} ──► validate ──► publish
//!                                                                  │
//!                                                   ValidationError (not published)
//! ```
//!
//! Publish failures are returned to the caller and never retried here.

pub mod fts;
pub mod module;
pub mod order;
pub mod system;
pub mod workflow;

pub use fts::FtsGateway;
pub use module::{ModuleCommand, ModuleGateway};
pub use order::{find_response, OrderGateway, OrderRequest, WorkpieceType};
pub use system::SystemGateway;
pub use workflow::WorkflowOrder;

use chrono::{DateTime, Utc};
use rumqttc::QoS;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::StateError;
use crate::mqtt::{Payload, PublishId, Publisher, TransportError};
use crate::registry::{
    substitute_str, substitute_value, RegistryError, TemplateLibrary, ValidationError, VarContext,
};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("topic '{0}' still contains unresolved placeholders")]
    UnresolvedTopic(String),

    #[error("template '{0}' does not describe a JSON object")]
    NotAnObject(String),
}

/// What was actually sent.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReceipt {
    pub topic: String,
    pub publish_id: PublishId,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Value,
}

/// One outgoing command before substitution and validation.
#[derive(Debug, Clone)]
pub(crate) struct Command<'a> {
    pub template_id: &'a str,
    pub topic: &'a str,
    pub payload: Value,
    pub qos: QoS,
    pub retain: bool,
}

/// Shared publish pipeline behind every gateway.
#[derive(Clone)]
pub struct Dispatcher {
    publisher: Arc<dyn Publisher>,
    templates: Arc<TemplateLibrary>,
}

impl Dispatcher {
    pub fn new(publisher: Arc<dyn Publisher>, templates: Arc<TemplateLibrary>) -> Self {
        Self {
            publisher,
            templates,
        }
    }

    pub fn templates(&self) -> &TemplateLibrary {
        &self.templates
    }

    /// Seed payload for a command: the template's first example.
    pub(crate) fn seed(&self, template_id: &str) -> Result<serde_json::Map<String, Value>, GatewayError> {
        match self.templates.example(template_id)? {
            Value::Object(map) => Ok(map),
            _ => Err(GatewayError::NotAnObject(template_id.to_string())),
        }
    }

    pub(crate) fn dispatch(
        &self,
        command: Command<'_>,
        ctx: &VarContext,
    ) -> Result<PublishReceipt, GatewayError> {
        let topic = substitute_str(command.topic, ctx);
        if topic.contains("{{") {
            return Err(GatewayError::UnresolvedTopic(topic));
        }
        let payload = substitute_value(&command.payload, ctx);

        let report = self.templates.validate(command.template_id, &payload)?;
        if let Err(e) = report.into_result(command.template_id) {
            warn!("Not publishing to {}: {}", topic, e);
            return Err(e.into());
        }

        let publish_id = self.publisher.publish_message(
            &topic,
            Payload::from_json(&payload),
            command.qos,
            command.retain,
        )?;
        info!(
            "Published {} to {} (qos {:?}, retain {})",
            command.template_id, topic, command.qos, command.retain
        );
        debug!("Payload: {}", payload);

        Ok(PublishReceipt {
            topic,
            publish_id,
            qos: command.qos,
            retain: command.retain,
            payload,
        })
    }
}

/// `2026-02-24T08:00:00.000Z`, the only timestamp form templates accept.
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn iso_now() -> String {
    iso_timestamp(Utc::now())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::mqtt::publisher::testing::MemoryPublisher;
    use std::path::Path;

    pub fn shipped_templates() -> Arc<TemplateLibrary> {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("registry");
        Arc::new(TemplateLibrary::load(&dir))
    }

    pub fn dispatcher() -> (Dispatcher, Arc<MemoryPublisher>) {
        let publisher = Arc::new(MemoryPublisher::new());
        (
            Dispatcher::new(publisher.clone(), shipped_templates()),
            publisher,
        )
    }
}
