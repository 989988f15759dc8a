use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
    In,
    Out,
    Err,
    Env,
}

impl std::fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttributeKind::In => write!(f, "in"),
            AttributeKind::Out => write!(f, "out"),
            AttributeKind::Err => write!(f, "err"),
            AttributeKind::Env => write!(f, "env"),
        }
    }
}

/// Key/value pair an executor attaches to the process it is running.
///
/// A process holds at most one attribute per `(kind, key)`; writing the same
/// pair again replaces the value and keeps the ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub id: Uuid,
    pub target_id: Uuid,
    /// Filled from the target process when the attribute is added
    pub colony_name: String,
    pub graph_id: Option<Uuid>,
    pub kind: AttributeKind,
    pub key: String,
    pub value: String,
    pub added_at: DateTime<Utc>,
}

impl Attribute {
    pub fn new(
        target_id: Uuid,
        kind: AttributeKind,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_id,
            colony_name: String::new(),
            graph_id: None,
            kind,
            key: key.into(),
            value: value.into(),
            added_at: Utc::now(),
        }
    }

    pub fn same_slot(&self, other: &Attribute) -> bool {
        self.target_id == other.target_id && self.kind == other.kind && self.key == other.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_target_kind_and_key() {
        let target = Uuid::new_v4();
        let a = Attribute::new(target, AttributeKind::Out, "result", "1");
        assert!(a.same_slot(&Attribute::new(target, AttributeKind::Out, "result", "2")));
        assert!(!a.same_slot(&Attribute::new(target, AttributeKind::Env, "result", "1")));
        assert!(!a.same_slot(&Attribute::new(Uuid::new_v4(), AttributeKind::Out, "result", "1")));
    }

    #[test]
    fn kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&AttributeKind::Env).unwrap(), "\"env\"");
        assert_eq!(AttributeKind::Err.to_string(), "err");
    }
}
