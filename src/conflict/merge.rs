// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Three-way field merge.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub value: Value,
    /// Fields both sides changed, decided by the tie-break
    pub contested: Vec<String>,
}

/// Merge a client change into the server's current object.
///
/// `client` holds only the fields the client wrote. A field the server did
/// not change since `base` takes the client value; a field the client did not
/// write keeps the server value. A field both changed goes to the client only
/// if `client_wins_ties`. Without a base every differing field is contested.
#[must_use]
pub fn three_way_merge(base: Option<&Value>, server: &Value, client: &Value, client_wins_ties: bool) -> MergeOutcome {
    let (Value::Object(server_fields), Value::Object(client_fields)) = (server, client) else {
        // Scalars and arrays merge as a single field
        if server == client || base == Some(server) {
            return MergeOutcome { value: client.clone(), contested: Vec::new() };
        }
        let value = if client_wins_ties { client.clone() } else { server.clone() };
        return MergeOutcome { value, contested: vec![String::new()] };
    };

    let base_fields = base.and_then(Value::as_object);
    let mut merged: Map<String, Value> = server_fields.clone();
    let mut contested = Vec::new();

    for (field, client_value) in client_fields {
        let server_value = server_fields.get(field);
        if server_value == Some(client_value) {
            continue;
        }
        let server_untouched = match base_fields {
            Some(base) => base.get(field) == server_value,
            None => server_value.is_none(),
        };
        if server_untouched || client_wins_ties {
            merged.insert(field.clone(), client_value.clone());
        }
        if !server_untouched {
            contested.push(field.clone());
        }
    }

    contested.sort();
    MergeOutcome { value: Value::Object(merged), contested }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_disjoint_edits_both_survive() {
        let base = json!({"name": "Ada", "bio": "math", "city": "London"});
        let server = json!({"name": "Ada", "bio": "math", "city": "Paris"});
        let client = json!({"bio": "code"});

        let out = three_way_merge(Some(&base), &server, &client, false);
        assert_eq!(out.value, json!({"name": "Ada", "bio": "code", "city": "Paris"}));
        assert!(out.contested.is_empty());
    }

    #[test]
    fn test_both_touched_uses_tie_break() {
        let base = json!({"name": "Ada"});
        let server = json!({"name": "Server"});
        let client = json!({"name": "Client"});

        let server_side = three_way_merge(Some(&base), &server, &client, false);
        assert_eq!(server_side.value, json!({"name": "Server"}));
        assert_eq!(server_side.contested, vec!["name"]);

        let client_side = three_way_merge(Some(&base), &server, &client, true);
        assert_eq!(client_side.value, json!({"name": "Client"}));
    }

    #[test]
    fn test_identical_change_is_not_contested() {
        let base = json!({"n": 1});
        let out = three_way_merge(Some(&base), &json!({"n": 2}), &json!({"n": 2}), false);
        assert_eq!(out.value, json!({"n": 2}));
        assert!(out.contested.is_empty());
    }

    #[test]
    fn test_client_only_field_added() {
        let out = three_way_merge(None, &json!({"a": 1}), &json!({"b": 2}), false);
        assert_eq!(out.value, json!({"a": 1, "b": 2}));
        assert!(out.contested.is_empty());
    }

    #[test]
    fn test_no_base_contests_differing_fields() {
        let out = three_way_merge(None, &json!({"a": 1}), &json!({"a": 2}), false);
        assert_eq!(out.value, json!({"a": 1}));
        assert_eq!(out.contested, vec!["a"]);
    }

    #[test]
    fn test_scalar_values() {
        let out = three_way_merge(Some(&json!(1)), &json!(1), &json!(5), false);
        assert_eq!(out.value, json!(5));

        let out = three_way_merge(Some(&json!(1)), &json!(2), &json!(5), false);
        assert_eq!(out.value, json!(2));
        assert_eq!(out.contested.len(), 1);
    }
}
