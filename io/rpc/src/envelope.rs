//! JSON error envelope carried in Triple error responses.
//!
//! ```json
//! {"status": 5, "message": "no such user", "details": [{"type": "x.Y", "value": "CgF4"}]}
//! ```
//!
//! The numeric `status` key is what this crate writes. Parsing also accepts
//! a `code` key and snake_case code names.

use crate::status::{Code, ErrorDetail, Status};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ErrorJson {
    #[serde(rename = "status", alias = "code")]
    code: CodeJson,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    details: Vec<DetailJson>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum CodeJson {
    Number(u32),
    Name(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct DetailJson {
    #[serde(rename = "type")]
    type_name: String,
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    debug: Option<serde_json::Value>,
}

impl ErrorJson {
    pub(crate) fn from_status(status: &Status) -> Self {
        Self {
            code: CodeJson::Number(status.code().as_u32()),
            message: status.message().map(str::to_string),
            details: status
                .details()
                .iter()
                .map(|d| DetailJson {
                    type_name: d.type_name.clone(),
                    value: STANDARD.encode(&d.value),
                    debug: d.debug.clone(),
                })
                .collect(),
        }
    }

    /// Convert back into a Status. Returns `None` for an unknown or OK code
    /// or an undecodable detail.
    pub(crate) fn into_status(self) -> Option<Status> {
        let code = match self.code {
            CodeJson::Number(n) => Code::try_from_u32(n)?,
            CodeJson::Name(name) => Code::from_name(&name)?,
        };
        if code.is_ok() {
            return None;
        }

        let mut status = match self.message {
            Some(message) => Status::new(code, message),
            None => Status::from_code(code),
        };
        for detail in self.details {
            let value = decode_base64(&detail.value)?;
            status = status.with_detail(ErrorDetail {
                type_name: detail.type_name,
                value,
                debug: detail.debug,
            });
        }
        Some(status)
    }
}

fn decode_base64(value: &str) -> Option<Bytes> {
    STANDARD
        .decode(value)
        .or_else(|_| STANDARD_NO_PAD.decode(value))
        .ok()
        .map(Bytes::from)
}

/// Serialize a non-OK status into the JSON error envelope.
pub fn error_to_json(status: &Status) -> Bytes {
    // serializing plain strings and numbers cannot fail
    serde_json::to_vec(&ErrorJson::from_status(status))
        .map(Bytes::from)
        .unwrap_or_default()
}

/// Parse a JSON error envelope.
///
/// Anything that is not a valid envelope yields `fallback`.
pub fn error_from_json(body: &[u8], fallback: Status) -> Status {
    serde_json::from_slice::<ErrorJson>(body)
        .ok()
        .and_then(ErrorJson::into_status)
        .unwrap_or(fallback)
}
