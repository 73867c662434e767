//! STREAM frame dispatch.
//!
//! The stream id discriminates service types multiplexed over one
//! connection. Two ids are recognized natively (credential management and
//! LED control); everything else routes to a registered service handler.

use crate::common::Error;
use crate::payload;

use log::debug;
use serde_json::Value;

/// Credential management service (ownership removal acks).
pub const STREAM_CREDENTIAL: u64 = 2;

/// LED / device command service.
pub const STREAM_LED: u64 = 3;

/// Callback for unrecognized stream ids, registered through the manager
/// API. Receives the connection's device id and the raw stream data.
pub type ServiceHandler = Box<dyn FnMut(&str, &[u8])>;

/// What a STREAM frame turned out to carry.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// `stream_id=2` acknowledged an ownership removal.
    OwnershipRemovalAck(Value),

    /// `stream_id=3` answered a LED/device command.
    LedResponse(Value),

    /// Recognized service id but not a shape we surface; dropped after a
    /// debug note.
    Ignored,

    /// Unknown service id; the engine consults registered handlers.
    Unregistered,
}

/// Classifies decoded STREAM data by service id.
pub fn classify(stream_id: u64, data: &[u8]) -> Result<StreamEvent, Error> {
    match stream_id {
        STREAM_CREDENTIAL => {
            let map = payload::decode_stream_object(data)?;

            let is_removal = map
                .get("status")
                .and_then(Value::as_str)
                .map(|s| s == "ownership_removed")
                .unwrap_or(false)
                || map
                    .get("type")
                    .and_then(Value::as_str)
                    .map(|s| s == "ownership_remove_ack")
                    .unwrap_or(false);

            if is_removal {
                Ok(StreamEvent::OwnershipRemovalAck(Value::Object(map)))
            } else {
                debug!("credential stream object without removal ack shape");
                Ok(StreamEvent::Ignored)
            }
        }

        STREAM_LED => {
            let map = payload::decode_stream_object(data)?;

            let is_led_status = map
                .get("$type$")
                .and_then(Value::as_str)
                .map(|s| s == "LEDStatusResponse")
                .unwrap_or(false);

            if is_led_status {
                Ok(StreamEvent::LedResponse(Value::Object(map)))
            } else {
                debug!("led stream object without LEDStatusResponse shape");
                Ok(StreamEvent::Ignored)
            }
        }

        _ => Ok(StreamEvent::Unregistered),
    }
}
