use crate::{Event, Filter, Kind, ID};
use serde::{de, de::SeqAccess, de::Visitor, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("empty message")]
    EmptyMessage,

    #[error("unknown envelope label: {0}")]
    UnknownLabel(String),

    #[error("invalid subscription ID")]
    InvalidSubscriptionId,

    #[error("REQ must have at least one filter")]
    ReqNoFilter,

    #[error("COUNT must carry a filter or a result")]
    InvalidCount,

    #[error("invalid count value")]
    InvalidCountValue,

    #[error("invalid auth event kind")]
    InvalidAuthEventKind,

    #[error("invalid challenge")]
    InvalidChallenge,
}

/// relay protocol envelopes: positional JSON arrays led by a verb
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// EVENT envelope (delivery from relay)
    EventIn {
        subscription_id: String,
        event: Event,
    },
    /// EVENT envelope (publish to relay)
    EventOut { event: Event },
    /// REQ envelope
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// COUNT envelope (query)
    CountAsk {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// COUNT envelope (reply)
    CountReply { subscription_id: String, count: u64 },
    /// NOTICE envelope
    Notice(String),
    /// EOSE envelope
    Eose { subscription_id: String },
    /// CLOSE envelope
    Close { subscription_id: String },
    /// CLOSED envelope
    Closed {
        subscription_id: String,
        reason: String,
    },
    /// OK envelope
    Ok {
        event_id: ID,
        ok: bool,
        reason: String,
    },
    /// AUTH envelope (challenge from relay)
    AuthChallenge { challenge: String },
    /// AUTH envelope (signed response event)
    AuthEvent { event: Event },
}

impl Serialize for Envelope {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeSeq;

        match self {
            Envelope::EventIn {
                subscription_id,
                event,
            } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("EVENT")?;
                seq.serialize_element(subscription_id)?;
                seq.serialize_element(event)?;
                seq.end()
            }
            Envelope::EventOut { event } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("EVENT")?;
                seq.serialize_element(event)?;
                seq.end()
            }
            Envelope::Req {
                subscription_id,
                filters,
            } => {
                let mut seq = serializer.serialize_seq(Some(2 + filters.len()))?;
                seq.serialize_element("REQ")?;
                seq.serialize_element(subscription_id)?;
                for filter in filters {
                    seq.serialize_element(filter)?;
                }
                seq.end()
            }
            Envelope::CountAsk {
                subscription_id,
                filters,
            } => {
                let mut seq = serializer.serialize_seq(Some(2 + filters.len()))?;
                seq.serialize_element("COUNT")?;
                seq.serialize_element(subscription_id)?;
                for filter in filters {
                    seq.serialize_element(filter)?;
                }
                seq.end()
            }
            Envelope::CountReply {
                subscription_id,
                count,
            } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("COUNT")?;
                seq.serialize_element(subscription_id)?;

                let mut result = serde_json::Map::new();
                result.insert("count".to_string(), Value::Number((*count).into()));
                seq.serialize_element(&result)?;
                seq.end()
            }
            Envelope::Notice(message) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("NOTICE")?;
                seq.serialize_element(message)?;
                seq.end()
            }
            Envelope::Eose { subscription_id } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("EOSE")?;
                seq.serialize_element(subscription_id)?;
                seq.end()
            }
            Envelope::Close { subscription_id } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("CLOSE")?;
                seq.serialize_element(subscription_id)?;
                seq.end()
            }
            Envelope::Closed {
                subscription_id,
                reason,
            } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("CLOSED")?;
                seq.serialize_element(subscription_id)?;
                seq.serialize_element(reason)?;
                seq.end()
            }
            Envelope::Ok {
                event_id,
                ok,
                reason,
            } => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element("OK")?;
                seq.serialize_element(&event_id.to_hex())?;
                seq.serialize_element(ok)?;
                seq.serialize_element(reason)?;
                seq.end()
            }
            Envelope::AuthChallenge { challenge } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("AUTH")?;
                seq.serialize_element(challenge)?;
                seq.end()
            }
            Envelope::AuthEvent { event } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("AUTH")?;
                seq.serialize_element(event)?;
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MsgVisitor;

        impl<'de> Visitor<'de> for MsgVisitor {
            type Value = Envelope;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a relay message array")
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Envelope, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let label: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::custom(EnvelopeError::EmptyMessage.to_string()))?;

                match label.as_str() {
                    "EVENT" => {
                        // a 2-element array is a publish, a 3-element array a delivery
                        let second_element: Value = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;

                        if let Ok(Some(third_element)) = seq.next_element::<Value>() {
                            let subscription_id = second_element
                                .as_str()
                                .ok_or_else(|| {
                                    de::Error::custom(
                                        EnvelopeError::InvalidSubscriptionId.to_string(),
                                    )
                                })?
                                .to_string();
                            let event: Event =
                                serde_json::from_value(third_element).map_err(de::Error::custom)?;
                            Ok(Envelope::EventIn {
                                subscription_id,
                                event,
                            })
                        } else {
                            let event: Event = serde_json::from_value(second_element)
                                .map_err(de::Error::custom)?;
                            Ok(Envelope::EventOut { event })
                        }
                    }
                    "REQ" => {
                        let subscription_id: String = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;

                        let mut filters = Vec::new();
                        while let Some(filter_value) = seq.next_element::<Value>()? {
                            let filter: Filter =
                                serde_json::from_value(filter_value).map_err(de::Error::custom)?;
                            filters.push(filter);
                        }

                        if filters.is_empty() {
                            return Err(de::Error::custom(EnvelopeError::ReqNoFilter.to_string()));
                        }

                        Ok(Envelope::Req {
                            subscription_id,
                            filters,
                        })
                    }
                    "COUNT" => {
                        let subscription_id: String = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;

                        let third_element: Value = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(2, &self))?;

                        if let Some(count_result) = third_element.as_object() {
                            if let Some(count_val) = count_result.get("count") {
                                let count = count_val.as_u64().ok_or_else(|| {
                                    de::Error::custom(EnvelopeError::InvalidCountValue.to_string())
                                })?;
                                return Ok(Envelope::CountReply {
                                    subscription_id,
                                    count,
                                });
                            }
                        }

                        let first: Filter = serde_json::from_value(third_element)
                            .map_err(|_| de::Error::custom(EnvelopeError::InvalidCount.to_string()))?;
                        let mut filters = vec![first];
                        while let Some(filter_value) = seq.next_element::<Value>()? {
                            let filter: Filter =
                                serde_json::from_value(filter_value).map_err(de::Error::custom)?;
                            filters.push(filter);
                        }

                        Ok(Envelope::CountAsk {
                            subscription_id,
                            filters,
                        })
                    }
                    "OK" => {
                        let event_id_str: String = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        let event_id = ID::parse(&event_id_str).map_err(de::Error::custom)?;
                        let ok: bool = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                        let reason: String = seq
                            .next_element()?
                            .or_else(|| if ok { Some("".to_string()) } else { None })
                            .ok_or_else(|| de::Error::invalid_length(3, &self))?;
                        Ok(Envelope::Ok {
                            event_id,
                            ok,
                            reason,
                        })
                    }
                    "NOTICE" => {
                        let reason: String = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        Ok(Envelope::Notice(reason))
                    }
                    "EOSE" => {
                        let subscription_id: String = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        Ok(Envelope::Eose { subscription_id })
                    }
                    "CLOSE" => {
                        let subscription_id: String = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        Ok(Envelope::Close { subscription_id })
                    }
                    "CLOSED" => {
                        let subscription_id: String = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        let reason: String = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                        Ok(Envelope::Closed {
                            subscription_id,
                            reason,
                        })
                    }
                    "AUTH" => {
                        let second_element: Value = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;

                        if second_element.is_object() {
                            let event: Event = serde_json::from_value(second_element)
                                .map_err(de::Error::custom)?;
                            if event.kind == Kind::CLIENT_AUTH {
                                Ok(Envelope::AuthEvent { event })
                            } else {
                                Err(de::Error::custom(
                                    EnvelopeError::InvalidAuthEventKind.to_string(),
                                ))
                            }
                        } else {
                            let challenge = second_element
                                .as_str()
                                .ok_or_else(|| {
                                    de::Error::custom(EnvelopeError::InvalidChallenge.to_string())
                                })?
                                .to_string();
                            Ok(Envelope::AuthChallenge { challenge })
                        }
                    }
                    other => Err(de::Error::custom(
                        EnvelopeError::UnknownLabel(other.to_string()).to_string(),
                    )),
                }
            }
        }

        deserializer.deserialize_seq(MsgVisitor)
    }
}

impl Envelope {
    /// get the label for this envelope type
    pub fn label(&self) -> &'static str {
        match self {
            Envelope::EventIn { .. } => "EVENT",
            Envelope::EventOut { .. } => "EVENT",
            Envelope::Req { .. } => "REQ",
            Envelope::CountAsk { .. } => "COUNT",
            Envelope::CountReply { .. } => "COUNT",
            Envelope::Notice(_) => "NOTICE",
            Envelope::Eose { .. } => "EOSE",
            Envelope::Close { .. } => "CLOSE",
            Envelope::Closed { .. } => "CLOSED",
            Envelope::Ok { .. } => "OK",
            Envelope::AuthChallenge { .. } => "AUTH",
            Envelope::AuthEvent { .. } => "AUTH",
        }
    }
}
