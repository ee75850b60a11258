//! Serde adapter that stores raw bytes as a standard base64 string.
//!
//! Use with `#[serde(with = "crate::util::base64_bytes")]` on any field whose
//! type is `AsRef<[u8]>` and `From<Vec<u8>>` (`Vec<u8>`, `bytes::Bytes`).

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: AsRef<[u8]>,
    S: Serializer,
{
    serializer.serialize_str(&STANDARD.encode(value.as_ref()))
}

pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: From<Vec<u8>>,
    D: Deserializer<'de>,
{
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map(T::from)
        .map_err(|err| D::Error::custom(format!("invalid base64 payload: {err}")))
}
