//! Administrative change notifications.
//!
//! The admin surface publishes one of these after every mutation. Payloads carry
//! identifiers only, never full entity bodies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    EndpointCreated,
    EndpointDeleted,
    OrganizationModified,
    SubscriptionModified,
    PricingModified,
    OrgPermissionModified,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::EndpointCreated,
        Topic::EndpointDeleted,
        Topic::OrganizationModified,
        Topic::SubscriptionModified,
        Topic::PricingModified,
        Topic::OrgPermissionModified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndpointCreated => "endpoint:created",
            Self::EndpointDeleted => "endpoint:deleted",
            Self::OrganizationModified => "organization:modified",
            Self::SubscriptionModified => "subscription:modified",
            Self::PricingModified => "pricing:modified",
            Self::OrgPermissionModified => "orgPermission:modified",
        }
    }

    /// Channel name on the bus, optionally namespaced as `{namespace}:{topic}`.
    pub fn channel(&self, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) if !ns.is_empty() => format!("{ns}:{}", self.as_str()),
            _ => self.as_str().to_string(),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoreError::UnknownTopic(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCreatedEvent {
    #[serde(alias = "Code")]
    pub code: String,
    #[serde(alias = "Path")]
    pub path: String,
    #[serde(alias = "Method")]
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDeletedEvent {
    #[serde(alias = "Code")]
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationModifiedEvent {
    #[serde(alias = "ID")]
    pub id: i32,
    #[serde(alias = "Name", default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionModifiedEvent {
    #[serde(alias = "ID")]
    pub id: i32,
    #[serde(alias = "OrganizationID", default)]
    pub organization_id: Option<i32>,
}

/// `kind` is `"custom"` when `id` is a subscription id (custom pricing),
/// anything else when it refers to a tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingModifiedEvent {
    #[serde(alias = "ID")]
    pub id: i32,
    #[serde(rename = "type", alias = "Type", default)]
    pub kind: String,
}

/// `id` is the organization whose permissions changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgPermissionModifiedEvent {
    #[serde(alias = "ID")]
    pub id: i32,
}

/// A decoded change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    EndpointCreated(EndpointCreatedEvent),
    EndpointDeleted(EndpointDeletedEvent),
    OrganizationModified(OrganizationModifiedEvent),
    SubscriptionModified(SubscriptionModifiedEvent),
    PricingModified(PricingModifiedEvent),
    OrgPermissionModified(OrgPermissionModifiedEvent),
}

impl ChangeEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::EndpointCreated(_) => Topic::EndpointCreated,
            Self::EndpointDeleted(_) => Topic::EndpointDeleted,
            Self::OrganizationModified(_) => Topic::OrganizationModified,
            Self::SubscriptionModified(_) => Topic::SubscriptionModified,
            Self::PricingModified(_) => Topic::PricingModified,
            Self::OrgPermissionModified(_) => Topic::OrgPermissionModified,
        }
    }

    /// Decode a raw payload received on `topic`.
    pub fn decode(topic: Topic, payload: &str) -> Result<Self, CoreError> {
        let event = match topic {
            Topic::EndpointCreated => Self::EndpointCreated(serde_json::from_str(payload)?),
            Topic::EndpointDeleted => Self::EndpointDeleted(serde_json::from_str(payload)?),
            Topic::OrganizationModified => {
                Self::OrganizationModified(serde_json::from_str(payload)?)
            }
            Topic::SubscriptionModified => {
                Self::SubscriptionModified(serde_json::from_str(payload)?)
            }
            Topic::PricingModified => Self::PricingModified(serde_json::from_str(payload)?),
            Topic::OrgPermissionModified => {
                Self::OrgPermissionModified(serde_json::from_str(payload)?)
            }
        };
        Ok(event)
    }

    pub fn encode(&self) -> Result<String, CoreError> {
        let payload = match self {
            Self::EndpointCreated(e) => serde_json::to_string(e)?,
            Self::EndpointDeleted(e) => serde_json::to_string(e)?,
            Self::OrganizationModified(e) => serde_json::to_string(e)?,
            Self::SubscriptionModified(e) => serde_json::to_string(e)?,
            Self::PricingModified(e) => serde_json::to_string(e)?,
            Self::OrgPermissionModified(e) => serde_json::to_string(e)?,
        };
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::OrgPermissionModified.as_str(), "orgPermission:modified");
        assert_eq!(
            "subscription:modified".parse::<Topic>().unwrap(),
            Topic::SubscriptionModified
        );
        assert!("subscription:deleted".parse::<Topic>().is_err());
    }

    #[test]
    fn test_channel_namespace() {
        assert_eq!(Topic::EndpointCreated.channel(None), "endpoint:created");
        assert_eq!(Topic::EndpointCreated.channel(Some("")), "endpoint:created");
        assert_eq!(
            Topic::EndpointCreated.channel(Some("prod")),
            "prod:endpoint:created"
        );
    }

    #[test]
    fn test_decode_accepts_capitalized_fields() {
        let event = ChangeEvent::decode(Topic::SubscriptionModified, r#"{"ID": 7}"#).unwrap();
        assert_eq!(
            event,
            ChangeEvent::SubscriptionModified(SubscriptionModifiedEvent {
                id: 7,
                organization_id: None
            })
        );

        let event = ChangeEvent::decode(
            Topic::EndpointCreated,
            r#"{"Code": "E1", "Path": "/e1", "Method": "GET"}"#,
        )
        .unwrap();
        assert_eq!(event.topic(), Topic::EndpointCreated);
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        assert!(ChangeEvent::decode(Topic::EndpointDeleted, r#"{"id": 3}"#).is_err());
        assert!(ChangeEvent::decode(Topic::PricingModified, "not json").is_err());
    }
}
