use serde_json::{Map, Value};
use std::fmt;
use tracing::debug;

use crate::gateway::WorkpieceType;
use crate::mqtt::SessionClient;

/// Storage slots of the high-bay warehouse, row-major.
pub const HBW_POSITIONS: [&str; 9] = ["A1", "A2", "A3", "B1", "B2", "B3", "C1", "C2", "C3"];

/// 3×3 view of what sits in the high-bay warehouse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HbwInventory {
    slots: [Option<WorkpieceType>; 9],
}

fn slot_index(position: &str) -> Option<usize> {
    HBW_POSITIONS.iter().position(|p| *p == position)
}

impl HbwInventory {
    /// From a module state report: `loads[].loadPosition` / `loads[].loadType`.
    pub fn from_state(state: &Value) -> Self {
        let mut inventory = Self::default();
        let loads = state.get("loads").and_then(Value::as_array);
        for load in loads.into_iter().flatten() {
            inventory.place(
                load.get("loadPosition").and_then(Value::as_str),
                load.get("loadType").and_then(Value::as_str),
            );
        }
        inventory
    }

    /// From the CCU stock report: `stockItems[].location` / `stockItems[].workpiece.type`.
    pub fn from_stock(stock: &Value) -> Self {
        let mut inventory = Self::default();
        let items = stock.get("stockItems").and_then(Value::as_array);
        for item in items.into_iter().flatten() {
            inventory.place(
                item.get("location").and_then(Value::as_str),
                item.pointer("/workpiece/type").and_then(Value::as_str),
            );
        }
        inventory
    }

    fn place(&mut self, position: Option<&str>, kind: Option<&str>) {
        let Some(position) = position else { return };
        let Some(index) = slot_index(position) else {
            debug!("Ignoring load at unknown position '{}'", position);
            return;
        };
        self.slots[index] = kind.and_then(|k| k.parse().ok());
    }

    /// Derives the grid from the newest message buffered under `topic`.
    pub fn latest(client: &SessionClient, topic: &str) -> Option<Self> {
        let message = client.latest(topic)?;
        message.payload.json().map(Self::from_state)
    }

    pub fn get(&self, position: &str) -> Option<WorkpieceType> {
        slot_index(position).and_then(|i| self.slots[i])
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn count(&self, kind: WorkpieceType) -> usize {
        self.slots.iter().filter(|s| **s == Some(kind)).count()
    }

    /// `{ "A1": "BLUE", "A2": null, ... }`
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = HBW_POSITIONS
            .iter()
            .zip(self.slots.iter())
            .map(|(pos, slot)| {
                let value = slot.map_or(Value::Null, |k| Value::from(k.as_str()));
                (pos.to_string(), value)
            })
            .collect();
        Value::Object(map)
    }
}

impl fmt::Display for HbwInventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.slots.chunks(3) {
            let cells: Vec<&str> = row
                .iter()
                .map(|slot| slot.map_or("-", |k| k.as_str()))
                .collect();
            writeln!(f, "{:<6}{:<6}{:<6}", cells[0], cells[1], cells[2])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionDescriptor;
    use crate::mqtt::Payload;
    use rumqttc::QoS;
    use serde_json::json;

    #[test]
    fn module_state_fills_the_grid() {
        let state = json!({"loads": [
            {"loadType": "BLUE", "loadPosition": "A1"},
            {"loadType": "RED", "loadPosition": "C3"},
        ]});
        let inventory = HbwInventory::from_state(&state);

        assert_eq!(inventory.get("A1"), Some(WorkpieceType::Blue));
        assert_eq!(inventory.get("C3"), Some(WorkpieceType::Red));
        assert_eq!(inventory.occupied(), 2);
        let grid = inventory.to_json();
        for pos in ["A2", "A3", "B1", "B2", "B3", "C1", "C2"] {
            assert_eq!(grid[pos], Value::Null, "{pos}");
        }
    }

    #[test]
    fn unknown_positions_and_types_are_ignored() {
        let state = json!({"loads": [
            {"loadType": "BLUE", "loadPosition": "D4"},
            {"loadType": "GREEN", "loadPosition": "B2"},
            {"loadPosition": "B1"},
        ]});
        let inventory = HbwInventory::from_state(&state);
        assert_eq!(inventory.occupied(), 0);
        assert_eq!(HbwInventory::from_state(&json!({})), HbwInventory::default());
    }

    #[test]
    fn stock_report_fills_the_grid() {
        let stock = json!({"ts": "2026-02-24T08:00:01.000Z", "stockItems": [
            {"location": "A1", "hbw": "SVR3QA0022", "workpiece": {"type": "BLUE", "state": "RAW"}},
            {"location": "A2", "hbw": "SVR3QA0022"},
            {"location": "B3", "hbw": "SVR3QA0022", "workpiece": {"type": "WHITE", "state": "RAW"}},
        ]});
        let inventory = HbwInventory::from_stock(&stock);
        assert_eq!(inventory.count(WorkpieceType::Blue), 1);
        assert_eq!(inventory.get("B3"), Some(WorkpieceType::White));
        assert_eq!(inventory.get("A2"), None);
        assert!(inventory.to_string().starts_with("BLUE  -"));
    }

    #[test]
    fn latest_reads_newest_buffer_entry() {
        let topic = "module/v1/ff/SVR3QA0022/state";
        let client = SessionClient::ephemeral(ConnectionDescriptor::local("127.0.0.1", 1));
        client.subscribe_many([topic], QoS::AtLeastOnce).unwrap();
        assert!(HbwInventory::latest(&client, topic).is_none());

        for payload in [
            json!({"loads": [{"loadType": "WHITE", "loadPosition": "B2"}]}),
            json!({"loads": [
                {"loadType": "BLUE", "loadPosition": "A1"},
                {"loadType": "RED", "loadPosition": "C3"},
            ]}),
        ] {
            client.ingest(topic, Payload::from_json(&payload), QoS::AtLeastOnce, false);
        }

        let inventory = HbwInventory::latest(&client, topic).unwrap();
        assert_eq!(inventory.get("A1"), Some(WorkpieceType::Blue));
        assert_eq!(inventory.get("C3"), Some(WorkpieceType::Red));
        assert_eq!(inventory.get("B2"), None);
    }
}
