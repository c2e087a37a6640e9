use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;

use crate::{Error, Result};

/// Raw KRPC envelope, fields are checked by [super::Message::from_bytes].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DHTMessage {
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Value>,

    #[serde(rename = "y", default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<Value>,

    #[serde(rename = "q", default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Value>,

    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,

    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,

    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Value>,
}

impl DHTMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<DHTMessage> {
        // Decode generically first, a derived struct visitor would happily
        // accept a bencoded list as positional fields.
        let mut dict = match serde_bencode::from_bytes::<Value>(bytes)? {
            Value::Dict(dict) => dict,
            _ => return Err(Error::MalformedMessage("not a dictionary")),
        };

        Ok(DHTMessage {
            transaction_id: dict.remove(b"t".as_ref()),
            message_type: dict.remove(b"y".as_ref()),
            method: dict.remove(b"q".as_ref()),
            arguments: dict.remove(b"a".as_ref()),
            response: dict.remove(b"r".as_ref()),
            error: dict.remove(b"e".as_ref()),
            version: dict.remove(b"v".as_ref()),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_bencode::to_bytes(self).map_err(Error::BencodeError)
    }
}
