//! Configuration text generation for imported resources that have no
//! configuration block yet.

use strata_domain::{Resource, Value};
use strata_provider::Block;

/// Render a resource block from the schema and the imported attributes.
/// Purely-computed attributes are omitted: they are the provider's to fill.
pub fn generate_config(resource: &Resource, block: &Block, attrs: &Value) -> String {
    let mut out = format!(
        "resource {:?} {:?} {{\n",
        resource.type_name, resource.name
    );
    if let Some(map) = attrs.as_map() {
        for (name, attr) in &block.attributes {
            if attr.flags.computed && !attr.flags.optional && !attr.flags.required {
                continue;
            }
            let Some(value) = map.get(name) else { continue };
            if value.is_null() {
                continue;
            }
            out.push_str(&format!("  {} = {}\n", name, render_value(value, 1)));
        }
    }
    out.push_str("}\n");
    out
}

fn render_value(value: &Value, depth: usize) -> String {
    let pad = "  ".repeat(depth + 1);
    let close_pad = "  ".repeat(depth);
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("{:?}", s),
        Value::List(items) => {
            if items.is_empty() {
                return "[]".to_string();
            }
            let inner = items
                .iter()
                .map(|item| format!("{}{},", pad, render_value(item, depth + 1)))
                .collect::<Vec<_>>()
                .join("\n");
            format!("[\n{}\n{}]", inner, close_pad)
        }
        Value::Map(entries) => {
            if entries.is_empty() {
                return "{}".to_string();
            }
            let inner = entries
                .iter()
                .map(|(k, v)| format!("{}{} = {}", pad, k, render_value(v, depth + 1)))
                .collect::<Vec<_>>()
                .join("\n");
            format!("{{\n{}\n{}}}", inner, close_pad)
        }
        // Unknown never appears in imported state; render a placeholder
        // rather than panicking if a provider misbehaves.
        Value::Unknown => "null # value not returned by import".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_provider::{AttributeFlags, AttributeType};

    #[test]
    fn renders_settable_attrs_only() {
        let block = Block::new()
            .attr("id", AttributeType::String, AttributeFlags::computed())
            .attr("test_string", AttributeType::String, AttributeFlags::optional())
            .attr("count_of", AttributeType::Int64, AttributeFlags::optional());
        let attrs = Value::from_json(serde_json::json!({
            "id": "123",
            "test_string": "foo",
            "count_of": 2,
            "absent": null,
        }));

        let text = generate_config(&Resource::managed("test_object", "a"), &block, &attrs);
        assert!(text.starts_with("resource \"test_object\" \"a\" {"));
        assert!(text.contains("test_string = \"foo\""));
        assert!(text.contains("count_of = 2"));
        assert!(!text.contains("id ="), "computed id must not be generated:\n{}", text);
        assert!(text.ends_with("}\n"));
    }

    #[test]
    fn renders_nested_collections() {
        let block = Block::new().attr(
            "tags",
            AttributeType::map(AttributeType::String),
            AttributeFlags::optional(),
        );
        let attrs = Value::from_json(serde_json::json!({"tags": {"env": "prod"}}));
        let text = generate_config(&Resource::managed("test_object", "a"), &block, &attrs);
        assert!(text.contains("tags = {"));
        assert!(text.contains("env = \"prod\""));
    }
}
