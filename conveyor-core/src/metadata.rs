// conveyor-core/src/metadata.rs
use std::collections::BTreeMap;

use serde_json::Value;

/// Attributes attached to a delivery, and the projected subset carried on a
/// message. Values keep whatever type the client surfaced them with.
pub type Metadata = BTreeMap<String, Value>;

/// Copies the allow-listed attributes of a delivery into message metadata.
///
/// Unrequested fields are never included. Requested names the client does not
/// expose are skipped silently, so a config written against a newer client
/// keeps working against an older one.
pub fn project(attributes: &Metadata, allow_list: &[String]) -> Metadata {
    allow_list
        .iter()
        .filter_map(|name| attributes.get(name).map(|v| (name.clone(), v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attributes() -> Metadata {
        Metadata::from([
            ("routing_key".into(), json!("orders.created")),
            ("priority".into(), json!(3)),
            ("redelivered".into(), json!(false)),
        ])
    }

    #[test]
    fn keeps_only_requested_fields() {
        let allow = vec!["routing_key".to_string()];
        let projected = project(&attributes(), &allow);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected["routing_key"], json!("orders.created"));
    }

    #[test]
    fn unknown_requested_fields_are_ignored() {
        let allow = vec!["priority".to_string(), "not_a_field".to_string()];
        let projected = project(&attributes(), &allow);
        assert_eq!(projected.len(), 1);
        assert!(!projected.contains_key("not_a_field"));
    }

    #[test]
    fn value_types_are_preserved() {
        let allow = vec!["priority".to_string(), "redelivered".to_string()];
        let projected = project(&attributes(), &allow);
        assert_eq!(projected["priority"], json!(3));
        assert_eq!(projected["redelivered"], json!(false));
    }

    #[test]
    fn empty_allow_list_yields_empty_metadata() {
        assert!(project(&attributes(), &[]).is_empty());
    }
}
