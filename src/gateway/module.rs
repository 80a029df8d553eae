use rumqttc::QoS;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{iso_now, Command, Dispatcher, GatewayError, PublishReceipt, WorkflowOrder};
use crate::error::StateError;

pub const MODULE_ORDER_TOPIC: &str = "module/v1/ff/{{module_serial}}/order";
const MODULE_ORDER_TEMPLATE: &str = "module.order";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleCommand {
    Pick,
    Drop,
    Mill,
    Drill,
    CheckQuality,
    Store,
    Retrieve,
}

impl ModuleCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleCommand::Pick => "PICK",
            ModuleCommand::Drop => "DROP",
            ModuleCommand::Mill => "MILL",
            ModuleCommand::Drill => "DRILL",
            ModuleCommand::CheckQuality => "CHECK_QUALITY",
            ModuleCommand::Store => "STORE",
            ModuleCommand::Retrieve => "RETRIEVE",
        }
    }
}

impl fmt::Display for ModuleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "PICK" => ModuleCommand::Pick,
            "DROP" => ModuleCommand::Drop,
            "MILL" => ModuleCommand::Mill,
            "DRILL" => ModuleCommand::Drill,
            "CHECK_QUALITY" => ModuleCommand::CheckQuality,
            "STORE" => ModuleCommand::Store,
            "RETRIEVE" => ModuleCommand::Retrieve,
            other => return Err(format!("unknown module command '{other}'")),
        })
    }
}

/// Sends order steps to individual production modules.
#[derive(Clone)]
pub struct ModuleGateway {
    dispatcher: Dispatcher,
}

impl ModuleGateway {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Publishes one step of `order`. When the order carries a plan,
    /// `command` must be the planned next step. The order only advances
    /// when the step was actually handed to the broker.
    pub fn command(
        &self,
        order: &mut WorkflowOrder,
        serial: &str,
        command: ModuleCommand,
        metadata: Value,
    ) -> Result<PublishReceipt, GatewayError> {
        let update_id = order.peek_next()?;
        if let Some(planned) = order.current_step() {
            if planned != command {
                return Err(StateError::WrongState {
                    operation: "module command",
                    state: format!(
                        "order {} expects {} as step {} (got {})",
                        order.order_id(),
                        planned,
                        update_id,
                        command
                    ),
                }
                .into());
            }
        }

        let mut payload = self.dispatcher.seed(MODULE_ORDER_TEMPLATE)?;
        payload.insert("serialNumber".into(), Value::from("{{module_serial}}"));
        payload.insert("orderId".into(), Value::from("{{order_id}}"));
        payload.insert("orderUpdateId".into(), Value::from(update_id));
        payload.insert("timestamp".into(), Value::from(iso_now()));
        payload.insert(
            "action".into(),
            json!({
                "id": Uuid::new_v4().to_string(),
                "command": command.as_str(),
                "metadata": metadata,
            }),
        );

        let ctx = order.context().clone().with("module_serial", serial);
        let receipt = self.dispatcher.dispatch(
            Command {
                template_id: MODULE_ORDER_TEMPLATE,
                topic: MODULE_ORDER_TOPIC,
                payload: Value::Object(payload),
                qos: QoS::AtLeastOnce,
                retain: false,
            },
            &ctx,
        )?;
        order.advance()?;
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::dispatcher;
    use crate::registry::VarContext;

    #[test]
    fn update_ids_run_one_two_three() {
        let (dispatcher, publisher) = dispatcher();
        let gateway = ModuleGateway::new(dispatcher);
        let mut order = WorkflowOrder::new(
            vec![ModuleCommand::Pick, ModuleCommand::Mill, ModuleCommand::Drop],
            VarContext::new(),
        );

        for command in [ModuleCommand::Pick, ModuleCommand::Mill, ModuleCommand::Drop] {
            gateway
                .command(&mut order, "SVR3QA0022", command, json!({"type": "BLUE"}))
                .unwrap();
        }

        let sent = publisher.sent();
        let ids: Vec<u64> = sent
            .iter()
            .map(|p| p.payload.json().unwrap()["orderUpdateId"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        for published in &sent {
            assert_eq!(published.topic, "module/v1/ff/SVR3QA0022/order");
            assert_eq!(published.qos, QoS::AtLeastOnce);
            let json = published.payload.json().unwrap();
            assert_eq!(json["orderId"], order.order_id());
            assert_eq!(json["serialNumber"], "SVR3QA0022");
        }
        assert_eq!(sent[1].payload.json().unwrap()["action"]["command"], "MILL");
    }

    #[test]
    fn failed_publish_does_not_consume_an_update_id() {
        let (dispatcher, publisher) = dispatcher();
        let gateway = ModuleGateway::new(dispatcher);
        let mut order = WorkflowOrder::new(Vec::new(), VarContext::new());

        publisher.set_failing(true);
        assert!(gateway
            .command(&mut order, "SVR3QA0022", ModuleCommand::Pick, json!({}))
            .is_err());
        publisher.set_failing(false);
        let receipt = gateway
            .command(&mut order, "SVR3QA0022", ModuleCommand::Pick, json!({}))
            .unwrap();
        assert_eq!(receipt.payload["orderUpdateId"], 1);
    }

    #[test]
    fn aborted_order_is_not_published() {
        let (dispatcher, publisher) = dispatcher();
        let gateway = ModuleGateway::new(dispatcher);
        let mut order = WorkflowOrder::with_id(
            "0a6f6a3c-3c7d-4a4c-9b8e-6f1d2c3b4a59",
            Vec::new(),
            VarContext::new(),
        );
        order.abort();
        let err = gateway
            .command(&mut order, "SVR3QA0022", ModuleCommand::Drop, json!({}))
            .unwrap_err();
        assert!(matches!(err, GatewayError::State(StateError::OrderAborted(_))));
        assert!(publisher.sent().is_empty());
    }

    #[test]
    fn non_object_metadata_fails_validation() {
        let (dispatcher, publisher) = dispatcher();
        let gateway = ModuleGateway::new(dispatcher);
        let mut order = WorkflowOrder::new(Vec::new(), VarContext::new());
        let err = gateway
            .command(&mut order, "SVR3QA0022", ModuleCommand::Drill, json!("fast"))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(ref v) if v.errors.iter().any(|e| e.contains("metadata"))));
        assert!(publisher.sent().is_empty());
        assert_eq!(order.update_id(), 0);
    }

    #[test]
    fn out_of_plan_command_is_rejected_before_publishing() {
        let (dispatcher, publisher) = dispatcher();
        let gateway = ModuleGateway::new(dispatcher);
        let mut order = WorkflowOrder::new(
            vec![ModuleCommand::Pick, ModuleCommand::Mill, ModuleCommand::Drop],
            VarContext::new(),
        );

        let err = gateway
            .command(&mut order, "SVR3QA0022", ModuleCommand::Drop, json!({}))
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::State(StateError::WrongState { ref state, .. }) if state.contains("PICK")
        ));
        assert!(publisher.sent().is_empty());
        assert_eq!(order.update_id(), 0);

        gateway
            .command(&mut order, "SVR3QA0022", ModuleCommand::Pick, json!({}))
            .unwrap();
        assert_eq!(order.current_step(), Some(ModuleCommand::Mill));
    }
}
