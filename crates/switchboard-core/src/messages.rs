//! Client-facing wire envelope.
//!
//! Every frame on a client connection is `{ "type": <string>, "data": <any> }`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::ConnectionId;

pub const JOIN: &str = "Join";
pub const SDP_OFFER_ANSWER: &str = "SdpOfferAnswer";

pub const WELCOME: &str = "Welcome";
pub const SDP_OFFER: &str = "SdpOffer";
pub const JOIN_ERROR: &str = "JoinError";
pub const ERROR: &str = "Error";
pub const PREDICTION: &str = "Prediction";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Payload of the `Welcome` notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WelcomeMessage {
    pub id: ConnectionId,
    pub message: String,
}

/// Payload of an inbound `Join`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub tenant_id: String,
}

/// Payload of an inbound `SdpOfferAnswer`.
#[derive(Clone, Debug, Deserialize)]
pub struct SdpAnswer {
    pub sdp: String,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn welcome(id: ConnectionId) -> Self {
        let payload = WelcomeMessage {
            id,
            message: "Welcome!".into(),
        };
        Self::new(WELCOME, serde_json::to_value(payload).unwrap_or_default())
    }

    pub fn sdp_offer(offer: impl Into<String>) -> Self {
        Self::new(SDP_OFFER, serde_json::Value::String(offer.into()))
    }

    pub fn join_error(message: impl Into<String>) -> Self {
        Self::new(JOIN_ERROR, serde_json::Value::String(message.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ERROR, serde_json::Value::String(message.into()))
    }

    pub fn prediction(fields: &BTreeMap<String, String>) -> Self {
        let data = fields
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect::<serde_json::Map<_, _>>();
        Self::new(PREDICTION, serde_json::Value::Object(data))
    }

    /// Decode the `data` field into a typed payload.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
