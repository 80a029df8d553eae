use rumqttc::QoS;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{iso_now, Command, Dispatcher, GatewayError, PublishReceipt};
use crate::registry::VarContext;

pub const INSTANT_ACTION_TOPIC: &str = "fts/v1/ff/{{fts_serial}}/instantAction";
const INSTANT_ACTION_TEMPLATE: &str = "fts.instant_action";

/// Actions whose effect outlives the command and must reach a vehicle that
/// connects later, so they are published retained.
pub const PERSISTENT_ACTIONS: &[&str] = &["findInitialDockPosition", "initPosition", "stopCharging"];

pub fn is_persistent(action_type: &str) -> bool {
    PERSISTENT_ACTIONS.contains(&action_type)
}

/// Instant actions for the driverless transport vehicle.
#[derive(Clone)]
pub struct FtsGateway {
    dispatcher: Dispatcher,
}

impl FtsGateway {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn instant_action(
        &self,
        serial: &str,
        action_type: &str,
        metadata: Option<Value>,
    ) -> Result<PublishReceipt, GatewayError> {
        let mut action = json!({
            "actionType": action_type,
            "actionId": Uuid::new_v4().to_string(),
        });
        if let (Some(meta), Some(map)) = (metadata, action.as_object_mut()) {
            map.insert("metadata".into(), meta);
        }

        let mut payload = self.dispatcher.seed(INSTANT_ACTION_TEMPLATE)?;
        payload.insert("serialNumber".into(), Value::from("{{fts_serial}}"));
        payload.insert("timestamp".into(), Value::from(iso_now()));
        payload.insert("actions".into(), Value::Array(vec![action]));

        self.dispatcher.dispatch(
            Command {
                template_id: INSTANT_ACTION_TEMPLATE,
                topic: INSTANT_ACTION_TOPIC,
                payload: Value::Object(payload),
                qos: QoS::ExactlyOnce,
                retain: is_persistent(action_type),
            },
            &VarContext::new().with("fts_serial", serial),
        )
    }

    /// Sends the vehicle to find its dock at `node_id`.
    pub fn dock(&self, serial: &str, node_id: &str) -> Result<PublishReceipt, GatewayError> {
        self.instant_action(
            serial,
            "findInitialDockPosition",
            Some(json!({ "nodeId": node_id })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::dispatcher;
    use crate::registry::schema::is_canonical_uuid;

    #[test]
    fn docking_is_retained_with_qos2() {
        let (dispatcher, publisher) = dispatcher();
        let gateway = FtsGateway::new(dispatcher);

        let receipt = gateway.dock("5iO4", "SVR4H73275").unwrap();

        assert_eq!(receipt.topic, "fts/v1/ff/5iO4/instantAction");
        assert!(receipt.retain);
        assert_eq!(receipt.qos, QoS::ExactlyOnce);
        assert_eq!(receipt.payload["serialNumber"], "5iO4");
        let action = &receipt.payload["actions"][0];
        assert_eq!(action["actionType"], "findInitialDockPosition");
        assert_eq!(action["metadata"]["nodeId"], "SVR4H73275");
        assert!(is_canonical_uuid(action["actionId"].as_str().unwrap()));

        let sent = publisher.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].retain);
    }

    #[test]
    fn transient_actions_are_not_retained() {
        let (dispatcher, _publisher) = dispatcher();
        let gateway = FtsGateway::new(dispatcher);
        let receipt = gateway.instant_action("5iO4", "cancelOrder", None).unwrap();
        assert!(!receipt.retain);
        assert!(receipt.payload["actions"][0].get("metadata").is_none());
    }

    #[test]
    fn empty_action_type_is_rejected() {
        let (dispatcher, publisher) = dispatcher();
        let gateway = FtsGateway::new(dispatcher);
        assert!(matches!(
            gateway.instant_action("5iO4", "", None),
            Err(GatewayError::Validation(_))
        ));
        assert!(publisher.sent().is_empty());
    }
}
