use crate::control::codec::DecodeError;
use crate::math::region::Rect;

/// A control-plane update, decoded once at the channel boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Replace(Vec<u8>),
    Remove,
    AddRegion(Rect),
    EraseRegion(Rect),
}

const ADD: &[u8] = b"add:";
const ERASE: &[u8] = b"erase:";
const SET: &[u8] = b"set:";
const REMOVE: &[u8] = b"remove";

impl ControlMessage {
    /// Reference and calibration channels: an empty payload removes.
    pub fn from_payload(payload: &[u8]) -> Self {
        if payload.is_empty() {
            ControlMessage::Remove
        } else {
            ControlMessage::Replace(payload.to_vec())
        }
    }

    /// Mask channel: `add:(x, y, w, h)`, `erase:(x, y, w, h)`, `set:<mask>` or `remove`.
    pub fn from_mask_payload(payload: &[u8]) -> Result<Self, DecodeError> {
        let rect = |rest: &[u8]| -> Result<Rect, DecodeError> {
            let text = std::str::from_utf8(rest)
                .map_err(|err| DecodeError::Message(err.to_string()))?;
            text.parse::<Rect>()
                .map_err(|err| DecodeError::Message(err.to_string()))
        };

        if let Some(rest) = payload.strip_prefix(ADD) {
            Ok(ControlMessage::AddRegion(rect(rest)?))
        } else if let Some(rest) = payload.strip_prefix(ERASE) {
            Ok(ControlMessage::EraseRegion(rect(rest)?))
        } else if let Some(rest) = payload.strip_prefix(SET) {
            Ok(ControlMessage::Replace(rest.to_vec()))
        } else if payload == REMOVE {
            Ok(ControlMessage::Remove)
        } else {
            Err(DecodeError::Message(format!(
                "unknown mask action {:?}",
                String::from_utf8_lossy(&payload[..payload.len().min(16)])
            )))
        }
    }

    /// Wire form on the mask channel.
    pub fn to_mask_payload(&self) -> Vec<u8> {
        match self {
            ControlMessage::AddRegion(rect) => [ADD, rect.to_string().as_bytes()].concat(),
            ControlMessage::EraseRegion(rect) => [ERASE, rect.to_string().as_bytes()].concat(),
            ControlMessage::Replace(bytes) => [SET, bytes.as_slice()].concat(),
            ControlMessage::Remove => REMOVE.to_vec(),
        }
    }
}
