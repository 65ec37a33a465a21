use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Account id as issued by the auth collaborator (opaque string)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a trip group ("groop").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct GroopId(pub String);

impl GroopId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Collection path of the group's messages in the backing store.
    pub fn messages_path(&self) -> String {
        format!("groops/{}/messages", self.0)
    }

    /// Collection path of the group's key exchange records.
    pub fn key_exchanges_path(&self) -> String {
        format!("groops/{}/keyExchanges", self.0)
    }
}

impl std::fmt::Display for GroopId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroopId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Temporary id for a locally-synthesized message awaiting confirmation.
    pub fn optimistic() -> Self {
        Self(format!(
            "{}{}",
            crate::constants::OPTIMISTIC_ID_PREFIX,
            Uuid::new_v4()
        ))
    }

    pub fn is_optimistic(&self) -> bool {
        self.0.starts_with(crate::constants::OPTIMISTIC_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimistic_ids_are_recognised() {
        let temp = MessageId::optimistic();
        assert!(temp.is_optimistic());
        assert!(!MessageId::generate().is_optimistic());
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = GroopId::new("trip-lisbon");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"trip-lisbon\"");
        assert_eq!(id.messages_path(), "groops/trip-lisbon/messages");
    }
}
