//! Change synthesis: composing prior, refreshed and planned values into a
//! concrete action.

use std::collections::BTreeMap;

use strata_domain::{AttrPath, Value};
use strata_provider::Block;
use strata_state::canonical_hash;

use crate::plan::{Action, ActionReason};

/// Byte-equality of two values ignoring marks (marks never enter the JSON
/// encoding).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    canonical_hash(&a.to_json_lossy()) == canonical_hash(&b.to_json_lossy())
}

/// Normalize an object value against its schema block: every declared
/// attribute is present, missing ones as null. Stored attribute JSON may omit
/// attributes; comparisons require the schema-complete shape.
pub fn normalize(block: &Block, value: Value) -> Value {
    let Value::Map(mut map) = value else {
        return value;
    };
    for name in block.attributes.keys() {
        map.entry(name.clone()).or_insert(Value::Null);
    }
    Value::Map(map)
}

/// Compose the proposed-new value sent to PlanResourceChange: configuration
/// wins for configurable attributes; computed attributes fall back to the
/// prior value, or — when no prior object exists at all — to unknown, since
/// only an apply can decide them.
pub fn proposed_new(block: &Block, prior: &Value, config: &Value) -> Value {
    if config.is_null() {
        // No configuration means a destroy proposal.
        return Value::Null;
    }
    let empty = BTreeMap::new();
    let config_map = config.as_map().unwrap_or(&empty);
    let creating = prior.is_null();
    let prior_map = prior.as_map().unwrap_or(&empty);

    let mut out = BTreeMap::new();
    for (name, attr) in &block.attributes {
        let config_value = config_map.get(name).cloned().unwrap_or(Value::Null);
        if !attr.flags.computed {
            out.insert(name.clone(), config_value);
            continue;
        }
        if !config_value.is_null() {
            // Optional+computed attribute set in configuration.
            out.insert(name.clone(), config_value);
            continue;
        }
        let value = if creating {
            Value::Unknown
        } else {
            prior_map.get(name).cloned().unwrap_or(Value::Null)
        };
        out.insert(name.clone(), value);
    }
    // Attributes outside the schema pass through unchanged; the provider is
    // the authority on whether they are acceptable.
    for (name, value) in config_map {
        out.entry(name.clone()).or_insert_with(|| value.clone());
    }
    Value::Map(out)
}

/// Derive the action for a managed resource instance from its before/after
/// pair plus the replacement triggers.
pub fn derive_action(
    before: &Value,
    planned: &Value,
    requires_replace: &[AttrPath],
    force_replace: bool,
    create_before_destroy: bool,
    tainted: bool,
) -> (Action, ActionReason) {
    let replace_action = if create_before_destroy {
        Action::CreateThenDelete
    } else {
        Action::DeleteThenCreate
    };

    match (before.is_null(), planned.is_null()) {
        (true, true) => (Action::NoOp, ActionReason::NoReason),
        (true, false) => (Action::Create, ActionReason::NoReason),
        (false, true) => (Action::Delete, ActionReason::NoReason),
        (false, false) => {
            if force_replace {
                return (replace_action, ActionReason::ReplaceByRequest);
            }
            if tainted {
                return (replace_action, ActionReason::ReplaceBecauseTainted);
            }
            if !requires_replace.is_empty() {
                return (replace_action, ActionReason::ReplaceBecauseCannotUpdate);
            }
            if values_equal(before, planned) {
                (Action::NoOp, ActionReason::NoReason)
            } else {
                (Action::Update, ActionReason::NoReason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_provider::{AttributeFlags, AttributeType};

    fn v(json: serde_json::Value) -> Value {
        Value::from_json(json)
    }

    fn block() -> Block {
        Block::new()
            .attr("id", AttributeType::String, AttributeFlags::computed())
            .attr("arg", AttributeType::String, AttributeFlags::optional())
    }

    #[test]
    fn normalize_fills_missing_attrs() {
        let value = normalize(&block(), v(serde_json::json!({"arg": "x"})));
        assert_eq!(value, v(serde_json::json!({"id": null, "arg": "x"})));
    }

    #[test]
    fn proposed_new_keeps_prior_computed() {
        let prior = v(serde_json::json!({"id": "x1", "arg": "old"}));
        let config = v(serde_json::json!({"arg": "new"}));
        let proposed = proposed_new(&block(), &prior, &config);
        assert_eq!(
            proposed,
            v(serde_json::json!({"id": "x1", "arg": "new"}))
        );
    }

    #[test]
    fn proposed_new_unknown_computed_on_create() {
        let proposed = proposed_new(&block(), &Value::Null, &v(serde_json::json!({"arg": "a"})));
        let map = proposed.as_map().unwrap();
        assert!(map["id"].is_unknown());
        assert_eq!(map["arg"], Value::string("a"));
    }

    #[test]
    fn action_table() {
        let a = v(serde_json::json!({"arg": "x"}));
        let b = v(serde_json::json!({"arg": "y"}));

        assert_eq!(
            derive_action(&Value::Null, &a, &[], false, false, false).0,
            Action::Create
        );
        assert_eq!(
            derive_action(&a, &Value::Null, &[], false, false, false).0,
            Action::Delete
        );
        assert_eq!(
            derive_action(&a, &a.clone(), &[], false, false, false).0,
            Action::NoOp
        );
        assert_eq!(
            derive_action(&a, &b, &[], false, false, false).0,
            Action::Update
        );
    }

    #[test]
    fn replacement_triggers_and_reasons() {
        let a = v(serde_json::json!({"arg": "x"}));
        let b = v(serde_json::json!({"arg": "y"}));
        let paths = vec![AttrPath::attr("arg")];

        assert_eq!(
            derive_action(&a, &b, &paths, false, false, false),
            (Action::DeleteThenCreate, ActionReason::ReplaceBecauseCannotUpdate)
        );
        assert_eq!(
            derive_action(&a, &b, &paths, false, true, false).0,
            Action::CreateThenDelete
        );
        assert_eq!(
            derive_action(&a, &a.clone(), &[], true, false, false),
            (Action::DeleteThenCreate, ActionReason::ReplaceByRequest)
        );
        assert_eq!(
            derive_action(&a, &a.clone(), &[], false, false, true),
            (Action::DeleteThenCreate, ActionReason::ReplaceBecauseTainted)
        );
    }

    #[test]
    fn equality_ignores_key_order_and_marks_never_enter() {
        let a = Value::from_json(serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap());
        let b = Value::from_json(serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap());
        assert!(values_equal(&a, &b));
    }
}
