//! Attribute values and cross-resource references.
//!
//! Attribute values are JSON-shaped, with two extra leaf forms: a reference
//! to another node's output (`{ ref: "node.output" }`) and a reference to a
//! cross-unit input (`{ input: "name" }`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Key marking an output reference in serialized form.
const REF_KEY: &str = "ref";

/// Key marking an input reference in serialized form.
const INPUT_KEY: &str = "input";

/// A single attribute value of a resource node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum AttributeValue {
    /// Null, bool, number or string.
    Literal(Value),
    /// Ordered list of values.
    List(Vec<AttributeValue>),
    /// Nested map of values.
    Map(BTreeMap<String, AttributeValue>),
    /// Reference to an output of another node in the same unit.
    Ref(OutputRef),
    /// Reference to a cross-unit input declared by the unit.
    Input(String),
}

/// Reference to a node output, written `node.output`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OutputRef {
    /// Node id.
    pub node: String,
    /// Output name.
    pub output: String,
}

/// Reference to another unit's node output, written `unit.node.output`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitOutputRef {
    /// Producing unit.
    pub unit: String,
    /// Node within the producing unit.
    pub node: String,
    /// Output name.
    pub output: String,
}

/// Source of concrete values for references during resolution.
pub trait ResolveScope {
    /// Returns the current value of a node output, if known.
    fn output(&self, reference: &OutputRef) -> Option<Value>;

    /// Returns the value of a cross-unit input, if known.
    fn input(&self, name: &str) -> Option<Value>;
}

impl AttributeValue {
    /// Creates a string literal.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::Literal(Value::String(value.into()))
    }

    /// Creates a reference to `node.output`.
    #[must_use]
    pub fn reference(node: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Ref(OutputRef::new(node, output))
    }

    /// Creates a reference to a cross-unit input.
    #[must_use]
    pub fn input(name: impl Into<String>) -> Self {
        Self::Input(name.into())
    }

    /// Visits this value and every nested value depth-first.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Self)) {
        visit(self);
        match self {
            Self::List(items) => items.iter().for_each(|item| item.walk(visit)),
            Self::Map(entries) => entries.values().for_each(|item| item.walk(visit)),
            Self::Literal(_) | Self::Ref(_) | Self::Input(_) => {}
        }
    }

    /// Returns every output reference contained in this value, in order.
    #[must_use]
    pub fn references(&self) -> Vec<&OutputRef> {
        let mut refs = Vec::new();
        self.walk(&mut |v| {
            if let Self::Ref(r) = v {
                refs.push(r);
            }
        });
        refs
    }

    /// Returns every input name contained in this value, in order.
    #[must_use]
    pub fn inputs(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.walk(&mut |v| {
            if let Self::Input(name) = v {
                names.push(name.as_str());
            }
        });
        names
    }

    /// Returns true if this value references any output of `node`.
    #[must_use]
    pub fn mentions(&self, node: &str) -> bool {
        self.references().iter().any(|r| r.node == node)
    }

    /// Returns true if this value contains any input reference.
    #[must_use]
    pub fn has_inputs(&self) -> bool {
        !self.inputs().is_empty()
    }

    /// Resolves references into concrete JSON.
    ///
    /// # Errors
    ///
    /// Returns the text of the first reference the scope cannot satisfy.
    pub fn resolve(&self, scope: &dyn ResolveScope) -> std::result::Result<Value, String> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve(scope))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (key, item) in entries {
                    map.insert(key.clone(), item.resolve(scope)?);
                }
                Ok(Value::Object(map))
            }
            Self::Ref(r) => scope.output(r).ok_or_else(|| r.to_string()),
            Self::Input(name) => scope
                .input(name)
                .ok_or_else(|| format!("{INPUT_KEY}:{name}")),
        }
    }
}

impl TryFrom<Value> for AttributeValue {
    type Error = ConfigError;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(Self::try_from)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Self::List),
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(Value::String(target)) = map.get(REF_KEY) {
                        return target.parse().map(Self::Ref);
                    }
                    if let Some(Value::String(name)) = map.get(INPUT_KEY) {
                        return Ok(Self::Input(name.clone()));
                    }
                }
                map.into_iter()
                    .map(|(k, v)| Self::try_from(v).map(|v| (k, v)))
                    .collect::<std::result::Result<BTreeMap<_, _>, _>>()
                    .map(Self::Map)
            }
            scalar => Ok(Self::Literal(scalar)),
        }
    }
}

impl From<AttributeValue> for Value {
    fn from(value: AttributeValue) -> Self {
        match value {
            AttributeValue::Literal(v) => v,
            AttributeValue::List(items) => Self::Array(items.into_iter().map(Into::into).collect()),
            AttributeValue::Map(entries) => {
                Self::Object(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            AttributeValue::Ref(r) => serde_json::json!({ REF_KEY: r.to_string() }),
            AttributeValue::Input(name) => serde_json::json!({ INPUT_KEY: name }),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::string(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Literal(Value::from(value))
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Literal(Value::Bool(value))
    }
}

impl OutputRef {
    /// Creates a new output reference.
    #[must_use]
    pub fn new(node: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            output: output.into(),
        }
    }
}

impl FromStr for OutputRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidReference {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let (node, output) = s
            .split_once('.')
            .ok_or_else(|| invalid("expected 'node.output'"))?;

        if node.is_empty() || output.is_empty() {
            return Err(invalid("node and output must be non-empty"));
        }
        if output.contains('.') {
            return Err(invalid("output name cannot contain '.'"));
        }

        Ok(Self::new(node, output))
    }
}

impl TryFrom<String> for OutputRef {
    type Error = ConfigError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OutputRef> for String {
    fn from(value: OutputRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.output)
    }
}

impl FromStr for UnitOutputRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [unit, node, output] if !unit.is_empty() && !node.is_empty() && !output.is_empty() => {
                Ok(Self {
                    unit: (*unit).to_string(),
                    node: (*node).to_string(),
                    output: (*output).to_string(),
                })
            }
            _ => Err(ConfigError::InvalidReference {
                value: s.to_string(),
                reason: String::from("expected 'unit.node.output'"),
            }),
        }
    }
}

impl TryFrom<String> for UnitOutputRef {
    type Error = ConfigError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UnitOutputRef> for String {
    fn from(value: UnitOutputRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for UnitOutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.unit, self.node, self.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedScope;

    impl ResolveScope for FixedScope {
        fn output(&self, reference: &OutputRef) -> Option<Value> {
            (reference.node == "fs").then(|| json!(format!("fs-123.{}", reference.output)))
        }

        fn input(&self, name: &str) -> Option<Value> {
            (name == "vpc_id").then(|| json!("vpc-9"))
        }
    }

    #[test]
    fn test_parse_ref_and_input_forms() {
        let value: AttributeValue = serde_yaml::from_str(
            r"
file_system: { ref: fs.id }
network: { input: vpc_id }
ports: [80, 5678]
tags: { ref: not-a-ref, team: ops }
",
        )
        .unwrap();

        let AttributeValue::Map(map) = &value else {
            panic!("expected map");
        };
        assert_eq!(map["file_system"], AttributeValue::reference("fs", "id"));
        assert_eq!(map["network"], AttributeValue::input("vpc_id"));
        assert!(matches!(map["ports"], AttributeValue::List(_)));
        // Two keys means a plain map, not a reference.
        assert!(matches!(map["tags"], AttributeValue::Map(_)));
    }

    #[test]
    fn test_invalid_ref_rejected() {
        let result: std::result::Result<AttributeValue, _> =
            serde_json::from_value(json!({ "ref": "no-dot" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_references_and_inputs_collected() {
        let value = AttributeValue::List(vec![
            AttributeValue::reference("fs", "id"),
            AttributeValue::input("vpc_id"),
            AttributeValue::reference("ap", "arn"),
        ]);

        let refs: Vec<String> = value.references().iter().map(ToString::to_string).collect();
        assert_eq!(refs, vec!["fs.id", "ap.arn"]);
        assert_eq!(value.inputs(), vec!["vpc_id"]);
        assert!(value.mentions("ap"));
        assert!(!value.mentions("net"));
    }

    #[test]
    fn test_resolve() {
        let value = AttributeValue::Map(BTreeMap::from([
            (String::from("fs"), AttributeValue::reference("fs", "id")),
            (String::from("vpc"), AttributeValue::input("vpc_id")),
        ]));

        let resolved = value.resolve(&FixedScope).unwrap();
        assert_eq!(resolved, json!({ "fs": "fs-123.id", "vpc": "vpc-9" }));

        let missing = AttributeValue::reference("lb", "dns_name");
        assert_eq!(missing.resolve(&FixedScope).unwrap_err(), "lb.dns_name");
    }

    #[test]
    fn test_serialize_keeps_reference_form() {
        let value = AttributeValue::reference("fs", "id");
        assert_eq!(Value::from(value), json!({ "ref": "fs.id" }));
    }

    #[test]
    fn test_unit_output_ref_parse() {
        let r: UnitOutputRef = "network.vpc.id".parse().unwrap();
        assert_eq!(r.unit, "network");
        assert_eq!(r.node, "vpc");
        assert_eq!(r.output, "id");
        assert!("network.vpc".parse::<UnitOutputRef>().is_err());
    }
}
