use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tool made available to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    /// Tool name
    pub name: String,
    /// What the tool does
    #[serde(default)]
    pub description: String,
    /// Parameter schema
    #[serde(default)]
    pub parameters: Schema,
}

impl ToolDeclaration {
    /// Declaration with an object parameter schema
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Schema) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// JSON-Schema-like parameter tree
///
/// `schema_type` is kept verbatim (providers disagree on case) and lowercased
/// on the way out where required. Keywords not modelled here survive in
/// `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub properties: IndexMap<String, Schema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Schema {
    fn typed(schema_type: &str) -> Self {
        Self {
            schema_type: Some(schema_type.to_owned()),
            ..Self::default()
        }
    }

    pub fn string() -> Self {
        Self::typed("string")
    }

    pub fn number() -> Self {
        Self::typed("number")
    }

    pub fn integer() -> Self {
        Self::typed("integer")
    }

    pub fn boolean() -> Self {
        Self::typed("boolean")
    }

    pub fn array(items: Self) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::typed("array")
        }
    }

    /// Object schema with the given properties, all of them required
    pub fn object<I, K>(properties: I) -> Self
    where
        I: IntoIterator<Item = (K, Self)>,
        K: Into<String>,
    {
        let properties: IndexMap<String, Self> = properties.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Self {
            required: properties.keys().cloned().collect(),
            properties,
            ..Self::typed("object")
        }
    }

    /// Attach a description
    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Bottom-up fold over the tree
    ///
    /// `f` receives each node together with the already-folded values of its
    /// properties and items.
    pub fn fold<T, F>(&self, f: &mut F) -> T
    where
        F: FnMut(&Self, IndexMap<String, T>, Option<T>) -> T,
    {
        let properties = self
            .properties
            .iter()
            .map(|(name, child)| (name.clone(), child.fold(f)))
            .collect();
        let items = self.items.as_deref().map(|child| child.fold(f));

        f(self, properties, items)
    }
}
