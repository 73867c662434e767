//! Credential handshake engine.
//!
//! Client and server roles for the VC exchange. These functions mutate a
//! single connection; table membership, demux and event emission stay in
//! the engine.

use std::time;

use crate::common::{unix_millis, Error};
use crate::config::Config;
use crate::conn::Conn;
use crate::keys;
use crate::payload::{AckStatus, HandshakeAck, VcInit};
use crate::vc::VerifiedInfo;

use log::{debug, warn};
use serde_json::Value;

/// Builds the VC_INIT frame body presented by a connecting client:
/// credential, challenge and timestamp.
pub fn build_vc_init(conn: &Conn) -> Vec<u8> {
    let credential = conn
        .local_vc
        .as_value()
        .cloned()
        .unwrap_or_else(|| {
            // opaque credential bytes still travel, as a string
            Value::String(String::from_utf8_lossy(conn.local_vc.as_bytes()).into_owned())
        });

    VcInit::to_bytes(&credential, &conn.challenge, unix_millis())
}

/// Builds the VC_RESPONSE frame body sent by the accepting server: status,
/// owner, device id, our credential, our challenge, and an ack of the
/// client's challenge.
pub fn build_vc_response(conn: &Conn, own_person_id: &str, client_challenge: &[u8]) -> Vec<u8> {
    let credential = conn.local_vc.as_value().cloned().unwrap_or(Value::Null);

    serde_json::to_vec(&serde_json::json!({
        "status": "provisioned",
        "owner": own_person_id,
        "device_id": conn.device_id,
        "credential": credential,
        "challenge": hex::encode(conn.challenge),
        "challenge_ack": hex::encode(client_challenge),
        "timestamp": unix_millis(),
    }))
    .expect("vc_response body serializes")
}

/// Builds the VC_ACK frame body that completes the exchange.
pub fn build_vc_ack(conn: &Conn) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "status": "established",
        "device_id": conn.device_id,
        "timestamp": unix_millis(),
    }))
    .expect("vc_ack body serializes")
}

/// Applies the correct-issuer rule to a VC_RESPONSE. Returns the owner
/// person id the session key derives from.
///
/// `already_owned` matches our ownership iff the reported owner is us; a
/// mismatch is a permanent rejection, not a retry.
pub fn evaluate_ack(ack: &HandshakeAck, own_person_id: &str) -> Result<String, Error> {
    match ack.status {
        AckStatus::Provisioned => Ok(ack
            .owner
            .clone()
            .unwrap_or_else(|| own_person_id.to_string())),

        AckStatus::AlreadyOwned => {
            let owner = ack.owner.clone().unwrap_or_default();
            if owner == own_person_id {
                Ok(owner)
            } else {
                Err(Error::AlreadyOwnedByOther(owner))
            }
        }

        AckStatus::Revoked | AckStatus::OwnershipRevoked => Err(Error::InvalidCredential),
    }
}

/// Client side: consumes an accepted VC_RESPONSE and moves the connection
/// to ESTABLISHED with a session key bound to the owner.
pub fn client_accept(
    conn: &mut Conn,
    ack: &HandshakeAck,
    own_person_id: &str,
    now: time::Instant,
    config: &Config,
) -> Result<(), Error> {
    let owner = evaluate_ack(ack, own_person_id)?;

    if conn.device_id.is_empty() {
        if let Some(device_id) = &ack.device_id {
            conn.device_id = device_id.clone();
        }
    }

    let device_id = conn.effective_device_id();

    // The embedded peer does not ship a full credential in its response;
    // the verified view is assembled from the ack fields.
    conn.remote_vc = Some(VerifiedInfo {
        issuer_person_id: owner.clone(),
        subject_device_id: device_id,
        subject_public_key: Vec::new(),
        raw: serde_json::json!({
            "status": match ack.status {
                AckStatus::Provisioned => "provisioned",
                AckStatus::AlreadyOwned => "already_owned",
                AckStatus::Revoked => "revoked",
                AckStatus::OwnershipRevoked => "ownership_revoked",
            },
            "owner": owner,
            "device_id": ack.device_id,
            "message": ack.message,
        }),
    });

    conn.session_key = Some(keys::derive_session_key(&owner));
    conn.set_handshake();
    conn.establish(now, config);

    Ok(())
}

/// Server side: consumes a verified VC_INIT. The issuer must be us; anyone
/// else's credential is rejected outright.
///
/// On success the connection holds the remote credential, derived keys and
/// a session key, and sits in HANDSHAKE until the client's VC_ACK lands.
pub fn server_accept(
    conn: &mut Conn,
    init: &VcInit,
    verified: VerifiedInfo,
    own_person_id: &str,
) -> Result<(), Error> {
    if verified.issuer_person_id != own_person_id {
        warn!(
            "credential issued by {} but we are {}",
            verified.issuer_person_id, own_person_id
        );
        return Err(Error::InvalidCredential);
    }

    conn.device_id = verified.subject_device_id.clone();

    let local_id = conn.local_vc.id().unwrap_or_default().to_string();
    let remote_id = verified
        .raw
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    conn.initial_key = Some(keys::derive_initial_key(&local_id, &remote_id));

    if let Some(challenge) = &init.challenge {
        let local_proof = conn.local_vc.proof().unwrap_or_default().as_bytes().to_vec();
        let remote_proof = verified
            .raw
            .get("proof")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .as_bytes()
            .to_vec();
        conn.handshake_key = Some(keys::derive_handshake_key(
            challenge,
            &local_proof,
            &remote_proof,
        ));
    }

    if !verified.subject_public_key.is_empty() {
        let local_public_key = conn
            .local_vc
            .as_value()
            .and_then(|v| v.get("public_key"))
            .and_then(Value::as_str)
            .and_then(|s| hex::decode(s).ok())
            .unwrap_or_default();
        conn.application_key = Some(keys::derive_application_key(
            &local_public_key,
            &verified.subject_public_key,
        ));
    }

    conn.session_key = Some(keys::derive_session_key(own_person_id));
    conn.remote_vc = Some(verified);
    conn.set_handshake();

    debug!("server handshake with {} advanced", conn.device_id);
    Ok(())
}
