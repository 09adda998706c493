use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::value_objects::{Address, Email};
use crate::events::EventPayload;

// ============================================================================
// Customer Domain Events
// ============================================================================
//
// Unrelated payload shapes sharing only the customer aggregate. Each is
// decoded by its own factory on the consuming side.
//
// ============================================================================

pub const CUSTOMER_AGGREGATE: &str = "customer";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerCreated {
    pub customer_id: String,
    pub email: Email,
    pub first_name: String,
    pub last_name: String,
}

impl EventPayload for CustomerCreated {
    const EVENT_TYPE: &'static str = "customer.created";
    const AGGREGATE_TYPE: &'static str = CUSTOMER_AGGREGATE;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerAddressAdded {
    pub customer_id: String,
    pub address_id: Uuid,
    pub address: Address,
    pub is_default: bool,
}

impl EventPayload for CustomerAddressAdded {
    const EVENT_TYPE: &'static str = "customer.address_added";
    const AGGREGATE_TYPE: &'static str = CUSTOMER_AGGREGATE;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFactory;

    #[test]
    fn test_created_payload_wire_shape() {
        let created = CustomerCreated {
            customer_id: "c1".into(),
            email: Email::parse("ada@example.com").unwrap(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
        };
        let json = serde_json::to_value(&created).unwrap();
        assert_eq!(json["customer_id"], "c1");
        assert_eq!(json["email"], "ada@example.com");

        let bytes = serde_json::to_vec(&created).unwrap();
        assert_eq!(CustomerCreated::factory().decode(&bytes).unwrap(), created);
    }

    #[test]
    fn test_factories_do_not_accept_each_others_payloads() {
        let added = serde_json::to_vec(&CustomerAddressAdded {
            customer_id: "c1".into(),
            address_id: Uuid::new_v4(),
            address: Address {
                street: "1 Main St".into(),
                city: "Springfield".into(),
                state: "IL".into(),
                postal_code: "62701".into(),
                country: "US".into(),
            },
            is_default: true,
        })
        .unwrap();
        assert!(CustomerCreated::factory().decode(&added).is_err());
    }
}
