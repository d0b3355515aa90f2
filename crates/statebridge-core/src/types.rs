use serde::{Deserialize, Serialize};
use std::fmt;

/// Application state shared between the applier and its consumers.
pub type State = serde_json::Value;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifies a connected consumer (window/process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(pub u32);

impl ConsumerId {
    /// The applier process itself. Used as the source of main-side dispatches.
    pub const MAIN: ConsumerId = ConsumerId(0);

    pub fn is_main(&self) -> bool {
        *self == Self::MAIN
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh, globally unique id.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Unique id of a single dispatched action.
    ActionId
);
string_id!(
    /// Unique id of a thunk (a node in an operation tree).
    ThunkId
);
string_id!(
    /// Unique id of one outgoing state update.
    UpdateId
);

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// An atomic mutation request. Identity is `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub bypass_lock: bool,
    #[serde(default)]
    pub bypass_access_control: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_thunk_id: Option<ThunkId>,
    #[serde(default)]
    pub starts_thunk: bool,
}

impl Action {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            id: ActionId::generate(),
            action_type: action_type.into(),
            payload: None,
            bypass_lock: false,
            bypass_access_control: false,
            parent_thunk_id: None,
            starts_thunk: false,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn bypassing_lock(mut self) -> Self {
        self.bypass_lock = true;
        self
    }

    pub fn bypassing_access_control(mut self) -> Self {
        self.bypass_access_control = true;
        self
    }

    pub fn in_thunk(mut self, thunk_id: ThunkId) -> Self {
        self.parent_thunk_id = Some(thunk_id);
        self
    }

    /// State key this action targets, derived from a `<key>:<verb>` type.
    ///
    /// `"user.profile:rename"` targets `user.profile`; an un-namespaced type
    /// such as `"reset"` targets no particular key.
    pub fn target_key(&self) -> Option<&str> {
        let (key, verb) = self.action_type.split_once(':')?;
        if key.is_empty() || verb.is_empty() {
            return None;
        }
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_serializes_type_field() {
        let action = Action::new("counter:increment");
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "counter:increment");
        assert!(json.get("payload").is_none());
        assert_eq!(json["bypass_lock"], false);
    }

    #[test]
    fn action_deserializes_with_defaults() {
        let action: Action =
            serde_json::from_str(r#"{"id":"a1","type":"reset"}"#).unwrap();
        assert_eq!(action.id.as_str(), "a1");
        assert!(!action.bypass_lock);
        assert!(action.parent_thunk_id.is_none());
    }

    #[test]
    fn target_key_from_namespaced_type() {
        assert_eq!(Action::new("counter:set").target_key(), Some("counter"));
        assert_eq!(
            Action::new("user.profile:rename").target_key(),
            Some("user.profile")
        );
        assert_eq!(Action::new("reset").target_key(), None);
        assert_eq!(Action::new(":oops").target_key(), None);
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(ActionId::generate(), ActionId::generate());
    }

    #[test]
    fn main_consumer_is_zero() {
        assert!(ConsumerId::MAIN.is_main());
        assert!(!ConsumerId(4).is_main());
    }
}
