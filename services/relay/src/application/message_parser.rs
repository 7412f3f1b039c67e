/// クライアントフレームのパーサー
///
/// NIP-01 のクライアントフレーム (EVENT, REQ, CLOSE, AUTH, COUNT) を分解する。
/// ここではフレームの形だけを確認し、イベントやフィルターの中身は
/// 各ハンドラーで検証する
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`
    Event(Value),

    /// `["REQ", <subscription_id>, <filter>...]`
    Req {
        subscription_id: String,
        filters: Vec<Value>,
    },

    /// `["CLOSE", <subscription_id>]`
    Close { subscription_id: String },

    /// `["AUTH", <event>]` (NIP-42)
    Auth(Value),

    /// `["COUNT", <subscription_id>, <filter>...]` (NIP-45)
    Count {
        subscription_id: String,
        filters: Vec<Value>,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Event(_) => "EVENT",
            ClientMessage::Req { .. } => "REQ",
            ClientMessage::Close { .. } => "CLOSE",
            ClientMessage::Auth(_) => "AUTH",
            ClientMessage::Count { .. } => "COUNT",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("failed to parse JSON")]
    InvalidJson,

    #[error("invalid message format")]
    NotArray,

    #[error("message type must be a string")]
    InvalidMessageType,

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("missing required fields")]
    MissingFields,

    #[error("subscription id must be a non-empty string")]
    InvalidSubscriptionId,
}

pub struct MessageParser;

impl MessageParser {
    /// ```
    /// use relay_engine::application::{ClientMessage, MessageParser};
    ///
    /// let message = MessageParser::parse(r#"["CLOSE", "sub1"]"#).unwrap();
    /// assert_eq!(message, ClientMessage::Close { subscription_id: "sub1".to_string() });
    /// ```
    pub fn parse(message: &str) -> Result<ClientMessage, ParseError> {
        let value: Value = serde_json::from_str(message).map_err(|_| ParseError::InvalidJson)?;
        let array = value.as_array().ok_or(ParseError::NotArray)?;

        let message_type = array
            .first()
            .ok_or(ParseError::MissingFields)?
            .as_str()
            .ok_or(ParseError::InvalidMessageType)?;

        match message_type {
            "EVENT" => Ok(ClientMessage::Event(Self::payload(array)?)),
            "AUTH" => Ok(ClientMessage::Auth(Self::payload(array)?)),
            "REQ" => {
                let (subscription_id, filters) = Self::subscription(array)?;
                Ok(ClientMessage::Req {
                    subscription_id,
                    filters,
                })
            }
            "COUNT" => {
                let (subscription_id, filters) = Self::subscription(array)?;
                Ok(ClientMessage::Count {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => {
                let (subscription_id, _) = Self::subscription(array)?;
                Ok(ClientMessage::Close { subscription_id })
            }
            other => Err(ParseError::UnknownMessageType(other.to_string())),
        }
    }

    fn payload(array: &[Value]) -> Result<Value, ParseError> {
        array.get(1).cloned().ok_or(ParseError::MissingFields)
    }

    /// サブスクリプションIDと、それに続く生のフィルター
    fn subscription(array: &[Value]) -> Result<(String, Vec<Value>), ParseError> {
        let subscription_id = array
            .get(1)
            .ok_or(ParseError::MissingFields)?
            .as_str()
            .ok_or(ParseError::InvalidSubscriptionId)?;
        if subscription_id.is_empty() {
            return Err(ParseError::InvalidSubscriptionId);
        }
        Ok((subscription_id.to_string(), array.iter().skip(2).cloned().collect()))
    }
}
