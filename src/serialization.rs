// serialization.rs - Type Registries for Transportable Values
//
//! Maps type tags to constructors so values can travel through messages,
//! journal entries and the database and be rebuilt on the other side.
//! Registering the same tag twice is an error everywhere; the registries
//! are explicit arenas, not process-wide globals.

use std::sync::Arc;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::agent::AgentFactory;
use crate::descriptor::Descriptor;

/// Serialization errors
#[derive(Debug, Clone, Error)]
pub enum SerializationError {
    #[error("Type tag already registered: {0}")]
    DuplicateTag(String),

    #[error("Unknown type tag: {0}")]
    UnknownTag(String),

    #[error("Value does not restore as {tag}: {reason}")]
    Restore { tag: String, reason: String },
}

/// A value that can be tagged, serialized and rebuilt elsewhere.
pub trait Transportable: Send + Sync {
    fn type_tag(&self) -> &'static str;

    fn to_value(&self) -> Result<Value, SerializationError>;
}

/// Constructor for one transportable type.
pub type RestoreFn =
    Arc<dyn Fn(&Value) -> Result<Box<dyn Transportable>, SerializationError> + Send + Sync>;

/// Registry of transportable value constructors.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    map: Arc<DashMap<String, RestoreFn>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        tag: impl Into<String>,
        restore: RestoreFn,
    ) -> Result<(), SerializationError> {
        let tag = tag.into();
        use dashmap::mapref::entry::Entry;
        match self.map.entry(tag.clone()) {
            Entry::Occupied(_) => Err(SerializationError::DuplicateTag(tag)),
            Entry::Vacant(vacant) => {
                debug!(%tag, "registered transportable type");
                vacant.insert(restore);
                Ok(())
            }
        }
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.map.contains_key(tag)
    }

    pub fn restore(
        &self,
        tag: &str,
        value: &Value,
    ) -> Result<Box<dyn Transportable>, SerializationError> {
        let restore = self
            .map
            .get(tag)
            .ok_or_else(|| SerializationError::UnknownTag(tag.to_string()))?;
        (restore.value())(value)
    }
}

/// Registry of agent factories keyed by descriptor `document_type`.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    map: Arc<DashMap<String, Arc<dyn AgentFactory>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, factory: Arc<dyn AgentFactory>) -> Result<(), SerializationError> {
        let tag = factory.document_type().to_string();
        use dashmap::mapref::entry::Entry;
        match self.map.entry(tag.clone()) {
            Entry::Occupied(_) => Err(SerializationError::DuplicateTag(tag)),
            Entry::Vacant(vacant) => {
                debug!(document_type = %tag, "registered agent factory");
                vacant.insert(factory);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, document_type: &str) -> Option<Arc<dyn AgentFactory>> {
        self.map
            .get(document_type)
            .map(|entry| entry.value().clone())
    }
}

/// Constructor producing a fresh descriptor for an agent type.
pub type DescriptorFn = Arc<dyn Fn() -> Descriptor + Send + Sync>;

/// Registry of descriptor constructors keyed by `document_type`, used by the
/// spawning queue when it is handed a type name instead of a descriptor.
#[derive(Clone, Default)]
pub struct DescriptorRegistry {
    map: Arc<DashMap<String, DescriptorFn>>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        document_type: impl Into<String>,
        materialize: DescriptorFn,
    ) -> Result<(), SerializationError> {
        let tag = document_type.into();
        use dashmap::mapref::entry::Entry;
        match self.map.entry(tag.clone()) {
            Entry::Occupied(_) => Err(SerializationError::DuplicateTag(tag)),
            Entry::Vacant(vacant) => {
                vacant.insert(materialize);
                Ok(())
            }
        }
    }

    pub fn materialize(&self, document_type: &str) -> Option<Descriptor> {
        self.map.get(document_type).map(|entry| (entry.value())())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Token {
        word: String,
    }

    impl Transportable for Token {
        fn type_tag(&self) -> &'static str {
            "token"
        }

        fn to_value(&self) -> Result<Value, SerializationError> {
            Ok(json!({"word": self.word}))
        }
    }

    fn restore_token(value: &Value) -> Result<Box<dyn Transportable>, SerializationError> {
        let word = value
            .get("word")
            .and_then(Value::as_str)
            .ok_or_else(|| SerializationError::Restore {
                tag: "token".into(),
                reason: "missing word".into(),
            })?;
        Ok(Box::new(Token {
            word: word.to_string(),
        }))
    }

    #[test]
    fn type_registry_round_trips() {
        let registry = TypeRegistry::new();
        registry
            .register("token", Arc::new(restore_token))
            .unwrap();

        let original = Token {
            word: "hello".into(),
        };
        let value = original.to_value().unwrap();
        let restored = registry.restore("token", &value).unwrap();
        assert_eq!(restored.type_tag(), "token");
        assert_eq!(restored.to_value().unwrap(), value);
    }

    #[test]
    fn duplicate_tag_is_an_error() {
        let registry = TypeRegistry::new();
        registry
            .register("token", Arc::new(restore_token))
            .unwrap();
        let err = registry
            .register("token", Arc::new(restore_token))
            .unwrap_err();
        assert!(matches!(err, SerializationError::DuplicateTag(_)));
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let registry = TypeRegistry::new();
        let err = match registry.restore("missing", &json!({})) {
            Err(e) => e,
            Ok(_) => panic!("expected restore to fail for an unregistered tag"),
        };
        assert!(matches!(err, SerializationError::UnknownTag(_)));
    }

    #[test]
    fn descriptor_registry_materializes() {
        let registry = DescriptorRegistry::new();
        registry
            .register(
                "worker",
                Arc::new(|| Descriptor::new("worker", uuid::Uuid::new_v4().to_string(), "lobby")),
            )
            .unwrap();

        let desc = registry.materialize("worker").unwrap();
        assert_eq!(desc.document_type, "worker");
        assert!(registry.materialize("unknown").is_none());
    }
}
