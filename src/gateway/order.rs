use chrono::{DateTime, Utc};
use rumqttc::QoS;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::{iso_timestamp, Command, Dispatcher, GatewayError, PublishReceipt};
use crate::mqtt::{EnvelopeMessage, SessionClient};
use crate::registry::VarContext;

pub const ORDER_REQUEST_TOPIC: &str = "ccu/order/request";
pub const ORDER_RESPONSE_TOPIC: &str = "ccu/order/response";
const ORDER_REQUEST_TEMPLATE: &str = "ccu.order.request";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkpieceType {
    Red,
    White,
    Blue,
}

impl WorkpieceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkpieceType::Red => "RED",
            WorkpieceType::White => "WHITE",
            WorkpieceType::Blue => "BLUE",
        }
    }
}

impl fmt::Display for WorkpieceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkpieceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RED" => Ok(WorkpieceType::Red),
            "WHITE" => Ok(WorkpieceType::White),
            "BLUE" => Ok(WorkpieceType::Blue),
            other => Err(format!("unknown workpiece type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub workpiece: WorkpieceType,
    /// External id echoed back by the CCU in its response.
    pub erp_order_id: Option<String>,
    pub request_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl OrderRequest {
    pub fn new(workpiece: WorkpieceType) -> Self {
        Self {
            workpiece,
            erp_order_id: None,
            request_id: None,
            timestamp: None,
        }
    }

    pub fn with_erp_id(mut self, erp_order_id: impl Into<String>) -> Self {
        self.erp_order_id = Some(erp_order_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Places production orders with the CCU.
#[derive(Clone)]
pub struct OrderGateway {
    dispatcher: Dispatcher,
}

impl OrderGateway {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn send(&self, request: &OrderRequest) -> Result<PublishReceipt, GatewayError> {
        let mut payload = self.dispatcher.seed(ORDER_REQUEST_TEMPLATE)?;
        payload.insert("type".into(), Value::from(request.workpiece.as_str()));
        payload.insert("orderType".into(), Value::from("PRODUCTION"));
        payload.insert(
            "timestamp".into(),
            Value::from(iso_timestamp(request.timestamp.unwrap_or_else(Utc::now))),
        );

        // Ids are forwarded as given; the CCU owns reconciliation.
        for (key, value) in [
            ("erpOrderId", &request.erp_order_id),
            ("requestId", &request.request_id),
        ] {
            match value {
                Some(v) => payload.insert(key.into(), Value::from(v.as_str())),
                None => payload.remove(key),
            };
        }
        payload.remove("orderId");

        self.dispatcher.dispatch(
            Command {
                template_id: ORDER_REQUEST_TEMPLATE,
                topic: ORDER_REQUEST_TOPIC,
                payload: Value::Object(payload),
                qos: QoS::ExactlyOnce,
                retain: false,
            },
            &VarContext::new(),
        )
    }
}

/// Newest `ccu/order/response` that echoes `id` as its `erpOrderId` or
/// `requestId`. Needs a subscription to the response topic.
pub fn find_response(client: &SessionClient, id: &str) -> Option<Arc<EnvelopeMessage>> {
    client
        .get_buffer(ORDER_RESPONSE_TOPIC)
        .into_iter()
        .rev()
        .find(|message| {
            message.payload.json().is_some_and(|json| {
                ["erpOrderId", "requestId"]
                    .iter()
                    .any(|key| json.get(key).and_then(Value::as_str) == Some(id))
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionDescriptor;
    use crate::gateway::testing::dispatcher;
    use crate::mqtt::Payload;
    use serde_json::json;

    #[test]
    fn order_request_goes_out_with_qos2_no_retain() {
        let (dispatcher, publisher) = dispatcher();
        let gateway = OrderGateway::new(dispatcher);
        let at = DateTime::parse_from_rfc3339("2026-02-24T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let receipt = gateway
            .send(&OrderRequest::new(WorkpieceType::Blue).at(at))
            .unwrap();

        assert_eq!(receipt.topic, "ccu/order/request");
        assert_eq!(
            receipt.payload,
            json!({"type": "BLUE", "orderType": "PRODUCTION", "timestamp": "2026-02-24T08:00:00.000Z"})
        );
        let sent = publisher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].qos, QoS::ExactlyOnce);
        assert!(!sent[0].retain);
        assert_eq!(sent[0].payload.json(), Some(&receipt.payload));
    }

    #[test]
    fn erp_and_request_ids_are_passed_through() {
        let (dispatcher, _publisher) = dispatcher();
        let gateway = OrderGateway::new(dispatcher);
        let receipt = gateway
            .send(
                &OrderRequest::new(WorkpieceType::Red)
                    .with_erp_id("ERP-1")
                    .with_request_id("req-9"),
            )
            .unwrap();
        assert_eq!(receipt.payload["erpOrderId"], "ERP-1");
        assert_eq!(receipt.payload["requestId"], "req-9");
    }

    #[test]
    fn empty_erp_id_fails_validation() {
        let (dispatcher, publisher) = dispatcher();
        let gateway = OrderGateway::new(dispatcher);
        let err = gateway
            .send(&OrderRequest::new(WorkpieceType::White).with_erp_id(""))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(publisher.sent().is_empty());
    }

    #[test]
    fn workpiece_parses_case_insensitively() {
        assert_eq!("blue".parse::<WorkpieceType>(), Ok(WorkpieceType::Blue));
        assert!("green".parse::<WorkpieceType>().is_err());
    }

    #[test]
    fn response_is_found_by_echoed_id() {
        let client = SessionClient::ephemeral(ConnectionDescriptor::local("127.0.0.1", 1));
        client
            .subscribe_many([ORDER_RESPONSE_TOPIC], QoS::AtLeastOnce)
            .unwrap();
        assert!(find_response(&client, "ERP-4711").is_none());

        for (erp, state) in [("ERP-1", "ENQUEUED"), ("ERP-4711", "ENQUEUED"), ("ERP-4711", "IN_PROGRESS")] {
            let payload = json!({"erpOrderId": erp, "state": state});
            client.ingest(
                ORDER_RESPONSE_TOPIC,
                Payload::from_json(&payload),
                QoS::AtLeastOnce,
                false,
            );
        }

        let found = find_response(&client, "ERP-4711").unwrap();
        assert_eq!(found.payload.json().unwrap()["state"], "IN_PROGRESS");
    }
}
