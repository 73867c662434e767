//! Verifiable-credential plumbing.
//!
//! The engine treats credentials as opaque bytes and hands them to an
//! external verifier. `Credential` adds a lazily parsed JSON view so the
//! handshake can pull out the identifiers it needs without copying the
//! bytes per packet.

use crate::common::Error;

use serde_json::Value;

/// A credential as handed in by the caller. One instance is shared per
/// connection for the connection's lifetime.
#[derive(Clone, Debug)]
pub struct Credential {
    bytes: Vec<u8>,
    json: Option<Value>,
}

impl Credential {
    pub fn from_bytes(bytes: Vec<u8>) -> Credential {
        let json = serde_json::from_slice(&bytes).ok();
        Credential { bytes, json }
    }

    pub fn from_value(value: Value) -> Credential {
        let bytes = serde_json::to_vec(&value).expect("credential value serializes");
        Credential {
            bytes,
            json: Some(value),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_value(&self) -> Option<&Value> {
        self.json.as_ref()
    }

    fn field(&self, name: &str) -> Option<&str> {
        self.json.as_ref()?.get(name)?.as_str()
    }

    pub fn id(&self) -> Option<&str> {
        self.field("id")
    }

    pub fn issuer(&self) -> Option<&str> {
        self.field("issuer")
    }

    pub fn subject(&self) -> Option<&str> {
        self.field("subject")
    }

    pub fn device_id(&self) -> Option<&str> {
        self.field("device_id").or_else(|| self.field("deviceId"))
    }

    pub fn proof(&self) -> Option<&str> {
        self.field("proof")
    }
}

/// The verifier's output for an accepted credential.
#[derive(Clone, Debug, PartialEq)]
pub struct VerifiedInfo {
    pub issuer_person_id: String,
    pub subject_device_id: String,
    pub subject_public_key: Vec<u8>,
    pub raw: Value,
}

/// External credential verifier capability. Called synchronously on the
/// engine loop; implementations that need to block should resolve off-loop
/// and feed the engine afterwards.
pub trait CredentialVerifier {
    fn verify(&self, credential: &[u8], expected_subject: &str) -> Result<VerifiedInfo, Error>;
}

/// Structural verifier used by the binary and tests: checks the credential
/// is well-formed JSON, names the expected subject, and has not expired.
/// Signature-proof verification belongs to the platform verifier and is NOT
/// performed here.
pub struct JsonCredentialVerifier;

impl CredentialVerifier for JsonCredentialVerifier {
    fn verify(&self, credential: &[u8], expected_subject: &str) -> Result<VerifiedInfo, Error> {
        let value: Value = serde_json::from_slice(credential)
            .map_err(|_| Error::InvalidCredential)?;

        let subject = value
            .get("subject")
            .and_then(Value::as_str)
            .ok_or(Error::InvalidCredential)?;

        if !expected_subject.is_empty() && subject != expected_subject {
            return Err(Error::InvalidCredential);
        }

        let issuer = value
            .get("issuer")
            .and_then(Value::as_str)
            .ok_or(Error::InvalidCredential)?;

        if let Some(expires_at) = value.get("expires_at").and_then(Value::as_u64) {
            if expires_at < crate::common::unix_millis() {
                return Err(Error::InvalidCredential);
            }
        }

        let device_id = value
            .get("device_id")
            .and_then(Value::as_str)
            .unwrap_or(subject)
            .to_string();

        let public_key = value
            .get("public_key")
            .and_then(Value::as_str)
            .and_then(|s| hex::decode(s).ok())
            .unwrap_or_default();

        Ok(VerifiedInfo {
            issuer_person_id: issuer.to_string(),
            subject_device_id: device_id,
            subject_public_key: public_key,
            raw: value,
        })
    }
}
