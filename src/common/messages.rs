//! Serialize and deserialize KRPC messages.

mod internal;

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_bencode::value::Value;
use tracing::debug;

use crate::common::{compact_nodes, Id, Node};
use crate::{Error, Result};

/// Largest datagram that crosses the usual paths without fragmentation.
pub const MAX_PACKET_SIZE: usize = 1472;

// Remote node errors
pub const ERROR_GENERIC: i64 = 200;
pub const ERROR_SERVER: i64 = 201;
pub const ERROR_MALFORMED_PACKET: i64 = 202;
pub const ERROR_METHOD_UNKNOWN: i64 = 203;
pub const ERROR_MALFORMED_REQUEST: i64 = 204;
pub const ERROR_INVALID_TOKEN: i64 = 205;
pub const ERROR_RESPONSE_TOO_LONG: i64 = 206;

// Local errors
pub const ERROR_INTERNAL: i64 = 100;
pub const ERROR_RECEIVED_UNKNOWN: i64 = 101;
pub const ERROR_TIMEOUT: i64 = 102;
pub const ERROR_STOPPED: i64 = 103;

// Methods
pub const PING: &str = "ping";
pub const FIND_NODE: &str = "find_node";
pub const FIND_VALUE: &str = "find_value";
pub const GET_VALUE: &str = "get_value";
pub const STORE_VALUE: &str = "store_value";

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    pub transaction_id: Vec<u8>,

    /// The version of the requester or responder.
    pub version: Option<Vec<u8>>,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(Dict),

    Error(ErrorSpecific),

    /// A well formed envelope with an unrecognized `y`.
    Unknown(Vec<u8>),
}

#[derive(Debug, PartialEq, Clone)]
pub struct RequestSpecific {
    pub method: String,
    pub arguments: Dict,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ErrorSpecific {
    pub code: i64,
    pub description: String,
}

impl ErrorSpecific {
    pub fn new(code: i64, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    pub fn server_error(description: impl Into<String>) -> Self {
        Self::new(ERROR_SERVER, description)
    }

    pub fn method_unknown(method: &str) -> Self {
        Self::new(ERROR_METHOD_UNKNOWN, format!("unknown method {}", method))
    }

    pub fn malformed_request(description: impl Into<String>) -> Self {
        Self::new(ERROR_MALFORMED_REQUEST, description)
    }

    pub fn invalid_token() -> Self {
        Self::new(ERROR_INVALID_TOKEN, "invalid token")
    }

    pub fn response_too_long(length: usize) -> Self {
        Self::new(
            ERROR_RESPONSE_TOO_LONG,
            format!("response was {} bytes", length),
        )
    }
}

impl Display for ErrorSpecific {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.description)
    }
}

/// A decoded bencode dictionary, used for request arguments and response payloads.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Dict(HashMap<Vec<u8>, Value>);

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert any struct that serializes to a bencode dictionary.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self> {
        let bytes = serde_bencode::to_bytes(value)?;

        match serde_bencode::from_bytes::<Value>(&bytes)? {
            Value::Dict(dict) => Ok(Dict(dict)),
            _ => Err(Error::MalformedMessage("not a dictionary")),
        }
    }

    /// Decode this dictionary into a typed struct.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = serde_bencode::to_bytes(&Value::Dict(self.0.clone()))?;

        Ok(serde_bencode::from_bytes(&bytes)?)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key.as_bytes())
    }

    pub fn insert(&mut self, key: &str, value: Value) -> Option<Value> {
        self.0.insert(key.as_bytes().to_vec(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key.as_bytes())
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.get(key) {
            Some(Value::Bytes(bytes)) => Some(bytes),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(Value::Int(int)) => Some(*int),
            _ => None,
        }
    }

    /// The `id` field every DHT request and response carries.
    pub fn get_id(&self) -> Option<Id> {
        self.get_bytes("id").and_then(|bytes| Id::from_bytes(bytes).ok())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn to_value(&self) -> Value {
        Value::Dict(self.0.clone())
    }
}

impl Message {
    pub fn request(transaction_id: Vec<u8>, method: &str, arguments: Dict) -> Self {
        Self {
            transaction_id,
            version: None,
            message_type: MessageType::Request(RequestSpecific {
                method: method.to_string(),
                arguments,
            }),
        }
    }

    pub fn response(transaction_id: Vec<u8>, payload: Dict) -> Self {
        Self {
            transaction_id,
            version: None,
            message_type: MessageType::Response(payload),
        }
    }

    pub fn error(transaction_id: Vec<u8>, error: ErrorSpecific) -> Self {
        Self {
            transaction_id,
            version: None,
            message_type: MessageType::Error(error),
        }
    }

    pub fn with_version(mut self, version: &[u8]) -> Self {
        self.version = Some(version.to_vec());
        self
    }

    /// Decode and verify a datagram. Structurally invalid input is rejected as a whole.
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        Message::from_serde_message(internal::DHTMessage::from_bytes(bytes.as_ref())?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.clone().into_serde_message().to_bytes()
    }

    /// Encode this message in at most `limit` bytes.
    ///
    /// Oversized responses carrying a `values` list are sent with the longest prefix
    /// of that list that fits, anything else oversized becomes a "response too long" error.
    /// Requests and errors are encoded as is.
    pub fn to_bytes_within(&self, limit: usize) -> Result<Vec<u8>> {
        let out = self.to_bytes()?;

        if out.len() <= limit {
            return Ok(out);
        }

        let payload = match &self.message_type {
            MessageType::Response(payload) => payload,
            _ => return Ok(out),
        };

        if let Some(Value::List(values)) = payload.get("values") {
            if let Some(count) = values_prefix_within(values, out.len() - limit)? {
                let mut payload = payload.clone();
                payload.insert("values", Value::List(values[..count].to_vec()));

                let shortened = Message {
                    message_type: MessageType::Response(payload),
                    ..self.clone()
                }
                .to_bytes()?;

                if shortened.len() <= limit {
                    debug!(
                        from = values.len(),
                        to = count,
                        length = shortened.len(),
                        "Shortened a long packet"
                    );
                    return Ok(shortened);
                }
            }
        }

        debug!(length = out.len(), "Could not send response, too long");

        Message {
            message_type: MessageType::Error(ErrorSpecific::response_too_long(out.len())),
            ..self.clone()
        }
        .to_bytes()
    }

    /// The `id` of the requester or responder, if any.
    pub fn get_author_id(&self) -> Option<Id> {
        match &self.message_type {
            MessageType::Request(request) => request.arguments.get_id(),
            MessageType::Response(payload) => payload.get_id(),
            MessageType::Error(_) | MessageType::Unknown(_) => None,
        }
    }

    fn into_serde_message(self) -> internal::DHTMessage {
        let mut message = internal::DHTMessage {
            transaction_id: Some(Value::Bytes(self.transaction_id)),
            version: self.version.map(Value::Bytes),
            ..Default::default()
        };

        match self.message_type {
            MessageType::Request(RequestSpecific { method, arguments }) => {
                message.message_type = Some(Value::Bytes(b"q".to_vec()));
                message.method = Some(Value::Bytes(method.into_bytes()));
                message.arguments = Some(arguments.to_value());
            }
            MessageType::Response(payload) => {
                message.message_type = Some(Value::Bytes(b"r".to_vec()));
                message.response = Some(payload.to_value());
            }
            MessageType::Error(error) => {
                message.message_type = Some(Value::Bytes(b"e".to_vec()));
                message.error = Some(Value::List(vec![
                    Value::Int(error.code),
                    Value::Bytes(error.description.into_bytes()),
                ]));
            }
            MessageType::Unknown(y) => {
                message.message_type = Some(Value::Bytes(y));
            }
        }

        message
    }

    fn from_serde_message(msg: internal::DHTMessage) -> Result<Message> {
        let message_type = match msg.message_type {
            Some(Value::Bytes(y)) => y,
            Some(_) => return Err(Error::MalformedMessage("message type is not a string")),
            None => return Err(Error::MalformedMessage("no message type")),
        };

        let message_type = match message_type.as_slice() {
            b"q" => {
                let method = match msg.method {
                    Some(Value::Bytes(q)) => String::from_utf8(q)
                        .map_err(|_| Error::MalformedMessage("request type is not a string"))?,
                    Some(_) => {
                        return Err(Error::MalformedMessage("request type is not a string"))
                    }
                    None => return Err(Error::MalformedMessage("request type not specified")),
                };

                let arguments = match msg.arguments {
                    Some(Value::Dict(a)) => Dict(a),
                    Some(_) => {
                        return Err(Error::MalformedMessage(
                            "arguments for request are not in a dictionary",
                        ))
                    }
                    None => return Err(Error::MalformedMessage("no arguments for request")),
                };

                MessageType::Request(RequestSpecific { method, arguments })
            }
            b"r" => match msg.response {
                Some(Value::Dict(r)) => MessageType::Response(Dict(r)),
                Some(_) => return Err(Error::MalformedMessage("response is not a dictionary")),
                None => return Err(Error::MalformedMessage("response not specified")),
            },
            b"e" => match msg.error {
                Some(Value::List(list)) => match list.as_slice() {
                    [Value::Int(code), Value::Bytes(description)] => {
                        MessageType::Error(ErrorSpecific {
                            code: *code,
                            description: String::from_utf8_lossy(description).into_owned(),
                        })
                    }
                    [_, _] => return Err(Error::MalformedMessage("error is not [int, string]")),
                    _ => return Err(Error::MalformedMessage("error is not a 2-element list")),
                },
                Some(_) => return Err(Error::MalformedMessage("error is not a list")),
                None => return Err(Error::MalformedMessage("error not specified")),
            },
            _ => MessageType::Unknown(message_type),
        };

        let transaction_id = match msg.transaction_id {
            Some(Value::Bytes(t)) => t,
            Some(_) => return Err(Error::MalformedMessage("transaction id is not a string")),
            None => return Err(Error::MalformedMessage("no transaction ID specified")),
        };

        Ok(Message {
            transaction_id,
            version: match msg.version {
                Some(Value::Bytes(v)) => Some(v),
                _ => None,
            },
            message_type,
        })
    }
}

/// Longest prefix of `values` whose encoded list is at least `excess` bytes
/// shorter than the encoded full list, or None if even the empty list is not.
///
/// Starts from an estimate that assumes equally sized items, then walks up
/// and down one item at a time to the exact count.
fn values_prefix_within(values: &[Value], excess: usize) -> Result<Option<usize>> {
    let lengths = values
        .iter()
        .map(|value| serde_bencode::to_bytes(value).map(|bytes| bytes.len()))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    // "l" + items + "e"
    let full_length = 2 + lengths.iter().sum::<usize>();

    let max_length = match full_length.checked_sub(excess) {
        Some(length) if length >= 2 => length,
        _ => return Ok(None),
    };

    let per_value = (full_length - 2) as f64 / values.len() as f64;
    let mut count = values
        .len()
        .saturating_sub((excess as f64 / per_value).ceil() as usize);

    let mut length = 2 + lengths[..count].iter().sum::<usize>();

    while length < max_length && count < values.len() {
        length += lengths[count];
        count += 1;
    }
    while length > max_length && count > 0 {
        count -= 1;
        length -= lengths[count];
    }

    Ok(Some(count))
}

/// A typed response payload, always identifying its responder.
pub trait ResponsePayload: DeserializeOwned {
    fn responder_id(&self) -> &Id;
}

/// The DHT verbs a node can be asked to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping,
    FindNode { target: Id },
    FindValue { key: Id },
    /// Ask for up to `num` values, 0 meaning all of them.
    GetValue { key: Id, num: usize },
    StoreValue { key: Id, value: Bytes, token: Bytes },
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Ping => PING,
            Request::FindNode { .. } => FIND_NODE,
            Request::FindValue { .. } => FIND_VALUE,
            Request::GetValue { .. } => GET_VALUE,
            Request::StoreValue { .. } => STORE_VALUE,
        }
    }

    /// Request arguments sent by `requester_id`.
    pub fn to_arguments(&self, requester_id: Id) -> Result<Dict> {
        let id = requester_id;

        match self.clone() {
            Request::Ping => Dict::from_serializable(&PingArguments { id }),
            Request::FindNode { target } => {
                Dict::from_serializable(&FindNodeArguments { id, target })
            }
            Request::FindValue { key } => Dict::from_serializable(&FindValueArguments { id, key }),
            Request::GetValue { key, num } => {
                Dict::from_serializable(&GetValueArguments { id, key, num })
            }
            Request::StoreValue { key, value, token } => {
                Dict::from_serializable(&StoreValueArguments {
                    id,
                    key,
                    value,
                    token,
                })
            }
        }
    }
}

// === PING ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PingArguments {
    pub id: Id,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PingResponse {
    pub id: Id,
}

// === FIND_NODE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FindNodeArguments {
    pub id: Id,
    pub target: Id,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FindNodeResponse {
    pub id: Id,
    #[serde(with = "compact_nodes", default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub token: Bytes,
}

// === FIND_VALUE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FindValueArguments {
    pub id: Id,
    pub key: Id,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FindValueResponse {
    pub id: Id,
    #[serde(with = "compact_nodes", default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub token: Bytes,
    /// Number of values the responder holds for the key.
    #[serde(default)]
    pub num: usize,
}

// === GET_VALUE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GetValueArguments {
    pub id: Id,
    pub key: Id,
    #[serde(default)]
    pub num: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GetValueResponse {
    pub id: Id,
    #[serde(default)]
    pub values: Vec<Bytes>,
}

// === STORE_VALUE ===

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoreValueArguments {
    pub id: Id,
    pub key: Id,
    pub value: Bytes,
    pub token: Bytes,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoreValueResponse {
    pub id: Id,
}

macro_rules! impl_response_payload {
    ($($response:ty),*) => {
        $(
            impl ResponsePayload for $response {
                fn responder_id(&self) -> &Id {
                    &self.id
                }
            }
        )*
    };
}

impl_response_payload!(
    PingResponse,
    FindNodeResponse,
    FindValueResponse,
    GetValueResponse,
    StoreValueResponse
);

#[cfg(test)]
mod tests {
    use super::*;

    fn values_response(values: Vec<Vec<u8>>) -> Message {
        let mut payload = Dict::from_serializable(&PingResponse { id: Id::random() }).unwrap();
        payload.insert(
            "values",
            Value::List(values.into_iter().map(Value::Bytes).collect()),
        );

        Message::response(vec![1, 2, 3, 4], payload)
    }

    fn encoded_values(bytes: &[u8]) -> Vec<Value> {
        match Message::from_bytes(bytes).unwrap().message_type {
            MessageType::Response(payload) => match payload.get("values") {
                Some(Value::List(values)) => values.clone(),
                _ => panic!("expected values"),
            },
            _ => panic!("expected a response"),
        }
    }

    #[test]
    fn test_request() {
        let original_msg = Message::request(
            vec![1, 2],
            FIND_NODE,
            Request::FindNode {
                target: Id::random(),
            }
            .to_arguments(Id::random())
            .unwrap(),
        )
        .with_version(b"KD01");

        let bytes = original_msg.to_bytes().unwrap();
        let parsed_msg = Message::from_bytes(bytes).unwrap();

        assert_eq!(parsed_msg, original_msg);
    }

    #[test]
    fn test_request_wire_shape() {
        let id = Id::from([b'a'; 20]);
        let msg = Message::request(
            b"aa".to_vec(),
            PING,
            Request::Ping.to_arguments(id).unwrap(),
        );

        assert_eq!(
            msg.to_bytes().unwrap(),
            b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:ping1:t2:aa1:y1:qe".to_vec()
        );
    }

    #[test]
    fn test_find_node_response() {
        let response = FindNodeResponse {
            id: Id::random(),
            nodes: vec![Node::new(Id::random(), "49.50.52.52:5354".parse().unwrap())],
            token: Bytes::from_static(b"abcd"),
        };

        let original_msg = Message::response(vec![9], Dict::from_serializable(&response).unwrap());

        let parsed_msg = Message::from_bytes(original_msg.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed_msg, original_msg);
        assert_eq!(parsed_msg.get_author_id(), Some(response.id));

        match parsed_msg.message_type {
            MessageType::Response(payload) => {
                assert_eq!(payload.parse::<FindNodeResponse>().unwrap(), response)
            }
            _ => panic!("expected a response"),
        }
    }

    #[test]
    fn test_error() {
        let original_msg = Message::error(vec![7, 7], ErrorSpecific::method_unknown("blah"));

        let bytes = original_msg.to_bytes().unwrap();
        assert_eq!(
            bytes,
            b"d1:eli203e19:unknown method blahe1:t2:\x07\x071:y1:ee".to_vec()
        );

        assert_eq!(Message::from_bytes(bytes).unwrap(), original_msg);
    }

    #[test]
    fn test_malformed() {
        let cases: [&[u8]; 11] = [
            b"garbage",
            b"li1ei2ee",
            b"d1:t2:aae",
            b"d1:y1:xe",
            b"d1:ade1:t2:aa1:y1:qe",
            b"d1:q4:ping1:t2:aa1:y1:qe",
            b"d1:ali1ee1:q4:ping1:t2:aa1:y1:qe",
            b"d1:ri1e1:t2:aa1:y1:re",
            b"d1:eli201ee1:t2:aa1:y1:ee",
            b"d1:el3:abc3:defe1:t2:aa1:y1:ee",
            b"d1:rd2:id2:aae1:ti1e1:y1:re",
        ];

        for case in cases {
            assert!(
                Message::from_bytes(case).is_err(),
                "should reject {:?}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn test_unknown_message_type() {
        let message = Message::from_bytes(b"d1:t2:aa1:y1:xe").unwrap();

        assert_eq!(message.transaction_id, b"aa".to_vec());
        assert_eq!(message.message_type, MessageType::Unknown(b"x".to_vec()));
        assert_eq!(message.to_bytes().unwrap(), b"d1:t2:aa1:y1:xe".to_vec());
    }

    #[test]
    fn test_malformed_arguments() {
        let mut arguments = Dict::new();
        arguments.insert("id", Value::Bytes(vec![1, 2, 3]));

        assert!(arguments.parse::<PingArguments>().is_err());
        assert!(Dict::new().parse::<FindNodeArguments>().is_err());
    }

    #[test]
    fn test_shorten_long_values() {
        let values = vec![vec![b'1'; 1]; 2000];
        let message = values_response(values.clone());

        assert!(message.to_bytes().unwrap().len() > MAX_PACKET_SIZE);

        let bytes = message.to_bytes_within(MAX_PACKET_SIZE).unwrap();
        assert!(bytes.len() <= MAX_PACKET_SIZE);

        let kept = encoded_values(&bytes);
        assert!(!kept.is_empty());

        // One more value would not have fit.
        let one_more = values_response(values[..kept.len() + 1].to_vec());
        assert!(one_more.to_bytes().unwrap().len() > MAX_PACKET_SIZE);
    }

    #[test]
    fn test_shorten_uneven_values() {
        let values = (0..400)
            .map(|i| vec![b'x'; 1 + (i * 7) % 23])
            .collect::<Vec<_>>();
        let message = values_response(values.clone());

        let mut previous = 0;

        for limit in (200..=1400).step_by(37) {
            let bytes = message.to_bytes_within(limit).unwrap();
            assert!(bytes.len() <= limit);

            let kept = encoded_values(&bytes).len();
            assert!(kept >= previous, "prefix shrank when the limit grew");
            previous = kept;

            let one_more = values_response(values[..kept + 1].to_vec());
            assert!(one_more.to_bytes().unwrap().len() > limit);
        }
    }

    #[test]
    fn test_too_long_without_values() {
        let mut payload = Dict::new();
        payload.insert("blob", Value::Bytes(vec![0; 2000]));

        let bytes = Message::response(vec![1], payload)
            .to_bytes_within(MAX_PACKET_SIZE)
            .unwrap();

        match Message::from_bytes(bytes).unwrap().message_type {
            MessageType::Error(error) => assert_eq!(error.code, ERROR_RESPONSE_TOO_LONG),
            _ => panic!("expected an error"),
        }
    }

    #[test]
    fn test_request_not_shortened() {
        let mut arguments = Dict::new();
        arguments.insert("blob", Value::Bytes(vec![0; 2000]));

        let message = Message::request(vec![1], STORE_VALUE, arguments);

        assert_eq!(
            message.to_bytes_within(MAX_PACKET_SIZE).unwrap(),
            message.to_bytes().unwrap()
        );
    }
}
