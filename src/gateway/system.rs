use rumqttc::QoS;
use serde_json::{Map, Value};
use std::sync::Arc;

use super::{iso_now, Command, Dispatcher, GatewayError, PublishReceipt};
use crate::factory::FactoryStateCache;
use crate::registry::VarContext;

/// CCU-wide commands on `ccu/set/*`. All of them are retained with QoS 2.
#[derive(Clone)]
pub struct SystemGateway {
    dispatcher: Dispatcher,
    cache: Option<Arc<FactoryStateCache>>,
}

impl SystemGateway {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            cache: None,
        }
    }

    /// Cache to invalidate when the warehouse is reset.
    pub fn with_cache(mut self, cache: Arc<FactoryStateCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn reset(&self, with_storage: bool) -> Result<PublishReceipt, GatewayError> {
        let receipt = self.send("reset", [("withStorage", Value::from(with_storage))])?;
        if with_storage {
            if let Some(cache) = &self.cache {
                cache.invalidate();
            }
        }
        Ok(receipt)
    }

    pub fn park(&self) -> Result<PublishReceipt, GatewayError> {
        self.send("park", [])
    }

    pub fn charge(&self, serial: &str, on: bool) -> Result<PublishReceipt, GatewayError> {
        self.send(
            "charge",
            [
                ("serialNumber", Value::from(serial)),
                ("charge", Value::from(on)),
            ],
        )
    }

    pub fn pair_fts(&self, serial: &str) -> Result<PublishReceipt, GatewayError> {
        self.send("pairFts", [("serialNumber", Value::from(serial))])
    }

    pub fn calibration(
        &self,
        serial: &str,
        values: Option<Value>,
    ) -> Result<PublishReceipt, GatewayError> {
        self.send(
            "calibration",
            [
                ("serialNumber", Value::from(serial)),
                ("values", values.unwrap_or(Value::Null)),
            ],
        )
    }

    fn send<const N: usize>(
        &self,
        command: &str,
        fields: [(&str, Value); N],
    ) -> Result<PublishReceipt, GatewayError> {
        let template_id = format!("ccu.set.{command}");
        let topic = format!("ccu/set/{command}");

        // Only the timestamp and the caller's fields go out, never the
        // example's sample values.
        let mut payload = Map::new();
        payload.insert("timestamp".into(), Value::from(iso_now()));
        for (key, value) in fields {
            if !value.is_null() {
                payload.insert(key.into(), value);
            }
        }

        self.dispatcher.dispatch(
            Command {
                template_id: &template_id,
                topic: &topic,
                payload: Value::Object(payload),
                qos: QoS::ExactlyOnce,
                retain: true,
            },
            &VarContext::new(),
        )
    }
}
