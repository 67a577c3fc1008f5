use serde_json::Value;

/// Recursive structural merge of one structured config over another.
///
/// Mapping-over-mapping merges key by key; every other combination
/// (scalar over mapping, mapping over scalar, list over anything)
/// replaces the base value outright. Pure and total - there is no
/// failure case.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, overlay_value) in overlay_map {
                match merged.get(key) {
                    Some(base_value) => {
                        let combined = deep_merge(base_value, overlay_value);
                        merged.insert(key.clone(), combined);
                    }
                    None => {
                        merged.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
            Value::Object(merged)
        }
        (_, replacement) => replacement.clone(),
    }
}

/// Empty mapping, the identity element for `deep_merge` on the overlay side.
pub fn empty_config() -> Value {
    Value::Object(serde_json::Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_overlay_is_identity() {
        let base = json!({"style": {"directness": "high"}, "max_depth": 3});
        assert_eq!(deep_merge(&base, &empty_config()), base);
    }

    #[test]
    fn nested_mappings_merge_recursively() {
        let base = json!({"style": {"directness": "high", "humor": "dry"}});
        let overlay = json!({"style": {"directness": "low"}});
        let merged = deep_merge(&base, &overlay);
        assert_eq!(merged["style"]["directness"], "low");
        assert_eq!(merged["style"]["humor"], "dry");
    }

    #[test]
    fn scalar_replaces_mapping_outright() {
        let base = json!({"routing": {"model": "large", "fallback": "small"}});
        let overlay = json!({"routing": "disabled"});
        let merged = deep_merge(&base, &overlay);
        assert_eq!(merged["routing"], "disabled");
    }

    #[test]
    fn mapping_replaces_scalar_outright() {
        let base = json!({"safety": "default"});
        let overlay = json!({"safety": {"extra_checks": true}});
        let merged = deep_merge(&base, &overlay);
        assert_eq!(merged["safety"]["extra_checks"], true);
    }

    #[test]
    fn lists_replace_rather_than_concatenate() {
        let base = json!({"allowed_tools": ["search", "calculator"]});
        let overlay = json!({"allowed_tools": ["search"]});
        let merged = deep_merge(&base, &overlay);
        assert_eq!(merged["allowed_tools"], json!(["search"]));
    }

    #[test]
    fn disjoint_key_merges_are_order_insensitive() {
        let a = json!({"style": {"directness": "high"}});
        let b = json!({"safety": {"extra_checks": true}});
        let c = json!({"limits": {"max_tokens": 512}});

        let left = deep_merge(&deep_merge(&a, &b), &c);
        let right = deep_merge(&a, &deep_merge(&b, &c));
        assert_eq!(left, right);
    }
}
