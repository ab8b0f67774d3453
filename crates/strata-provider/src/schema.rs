//! Schema types describing provider, resource and data-source structure.
//!
//! Schemas are fetched once per provider source and treated as immutable for
//! the duration of a plan.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use strata_domain::AttrPath;

/// The type of an attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    String,
    Int64,
    Float64,
    Bool,
    List(Box<AttributeType>),
    Set(Box<AttributeType>),
    Map(Box<AttributeType>),
    Object(BTreeMap<String, AttributeType>),
    /// A dynamic type that can hold any value (use sparingly).
    Dynamic,
}

impl AttributeType {
    pub fn list(element: AttributeType) -> Self {
        AttributeType::List(Box::new(element))
    }

    pub fn map(element: AttributeType) -> Self {
        AttributeType::Map(Box::new(element))
    }
}

/// Describes how an attribute can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttributeFlags {
    pub required: bool,
    pub optional: bool,
    /// Set by the provider, read-only in configuration.
    pub computed: bool,
    pub sensitive: bool,
}

impl AttributeFlags {
    pub fn required() -> Self {
        AttributeFlags { required: true, ..Default::default() }
    }

    pub fn optional() -> Self {
        AttributeFlags { optional: true, ..Default::default() }
    }

    pub fn computed() -> Self {
        AttributeFlags { computed: true, ..Default::default() }
    }

    pub fn optional_computed() -> Self {
        AttributeFlags { optional: true, computed: true, ..Default::default() }
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// One attribute in a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    #[serde(flatten)]
    pub flags: AttributeFlags,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Attribute {
    pub fn new(attr_type: AttributeType, flags: AttributeFlags) -> Self {
        Attribute { attr_type, flags, description: None }
    }
}

/// A schema block: the shape of a provider config, resource or data source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub attributes: BTreeMap<String, Attribute>,
}

impl Block {
    pub fn new() -> Self {
        Block::default()
    }

    pub fn attr(
        mut self,
        name: impl Into<String>,
        attr_type: AttributeType,
        flags: AttributeFlags,
    ) -> Self {
        self.attributes
            .insert(name.into(), Attribute::new(attr_type, flags));
        self
    }

    /// Paths of attributes the schema declares sensitive; applied as marks to
    /// every value of this block's type.
    pub fn sensitive_paths(&self) -> Vec<AttrPath> {
        self.attributes
            .iter()
            .filter(|(_, a)| a.flags.sensitive)
            .map(|(name, _)| AttrPath::attr(name.clone()))
            .collect()
    }

    /// Names of computed attributes, used when composing a proposed-new value
    /// from prior state and configuration.
    pub fn computed_attrs(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|(_, a)| a.flags.computed)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// A resource type's schema plus its current version, for upgrade decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSchema {
    pub block: Block,
    pub version: u64,
}

impl ResourceSchema {
    pub fn new(block: Block, version: u64) -> Self {
        ResourceSchema { block, version }
    }
}

/// Everything a provider declares about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSchema {
    pub provider: Block,
    pub resources: BTreeMap<String, ResourceSchema>,
    pub data_sources: BTreeMap<String, Block>,
}

impl ProviderSchema {
    pub fn resource(&self, type_name: &str) -> Option<&ResourceSchema> {
        self.resources.get(type_name)
    }

    pub fn data_source(&self, type_name: &str) -> Option<&Block> {
        self.data_sources.get(type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_paths_from_flags() {
        let block = Block::new()
            .attr("id", AttributeType::String, AttributeFlags::computed())
            .attr(
                "token",
                AttributeType::String,
                AttributeFlags::optional().sensitive(),
            );
        assert_eq!(block.sensitive_paths(), vec![AttrPath::attr("token")]);
        assert_eq!(block.computed_attrs(), vec!["id"]);
    }
}
