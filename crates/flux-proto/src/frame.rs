//! FLUX01 frame protocol: the multipart wire encoding of [`crate::Message`].
//!
//! Adapted from the HOOT01 frame layout (fixed-width header frames followed
//! by variable-width ones) but carrying the overlay's request/response/
//! event/control model and route stack instead of a worker-pool command set.
//!
//! ## Wire format
//!
//! A FLUX01 message is a 9-frame ZMQ multipart message (plus whatever
//! identity frames a ROUTER socket prepends, which callers strip before
//! calling [`Frame::decode`]):
//!
//! ```text
//! Frame 0: Protocol version   "FLUX01" (6 bytes)
//! Frame 1: Kind               1 byte
//! Frame 2: Flags              1 byte bitmask
//! Frame 3: Role               1 byte bitmask
//! Frame 4: Matchtag           4 bytes (big-endian u32)
//! Frame 5: User id             4 bytes (big-endian u32, 0xFFFFFFFF = absent)
//! Frame 6: Sequence            8 bytes (big-endian u64, 0 = absent)
//! Frame 7: Control value       8 bytes (big-endian i64, only meaningful
//!                               when Kind == Control; control *kind* is
//!                               folded into frame 1 alongside Kind)
//! Frame 8: Topic               UTF-8 string (empty for control messages)
//! Frame 9: Route stack         uuids joined by NUL
//! Frame 10: Payload            raw bytes
//! ```
//!
//! Control messages reuse the `Kind` byte's upper nibble to carry the
//! control sub-kind (heartbeat/status/disconnect), since a control message
//! never needs the Request/Response/Event discriminant alongside it.

use bytes::Bytes;

use crate::message::{ControlKind, Flags, Kind, Message, Role};

pub const PROTOCOL_VERSION: &[u8] = b"FLUX01";
pub const FRAME_COUNT: usize = 11;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("missing FLUX01 magic frame")]
    MissingMagic,
    #[error("expected {FRAME_COUNT} frames after magic, got {0}")]
    WrongFrameCount(usize),
    #[error("invalid kind byte {0}")]
    InvalidKind(u8),
    #[error("invalid control kind {0}")]
    InvalidControlKind(u8),
    #[error("frame {0} has the wrong fixed width")]
    BadWidth(usize),
    #[error("topic is not valid UTF-8")]
    BadTopic,
    #[error("route entry is not valid UTF-8")]
    BadRoute,
}

fn kind_byte(kind: Kind, control: Option<(ControlKind, i64)>) -> u8 {
    match kind {
        Kind::Request => 0,
        Kind::Response => 1,
        Kind::Event => 2,
        Kind::Control => 0x80 | control.map(|(k, _)| k.to_u8()).unwrap_or(0),
    }
}

fn decode_kind_byte(b: u8) -> Result<(Kind, Option<ControlKind>), FrameError> {
    if b & 0x80 != 0 {
        let ck = ControlKind::from_u8(b & 0x7f).ok_or(FrameError::InvalidControlKind(b & 0x7f))?;
        Ok((Kind::Control, Some(ck)))
    } else {
        match b {
            0 => Ok((Kind::Request, None)),
            1 => Ok((Kind::Response, None)),
            2 => Ok((Kind::Event, None)),
            other => Err(FrameError::InvalidKind(other)),
        }
    }
}

/// Encode a [`Message`] into the FLUX01 multipart frame list, magic frame
/// included. Each entry is a frame ready to hand to a ZMQ multipart send.
pub fn encode(msg: &Message) -> Vec<Bytes> {
    let (control_kind, control_value) = match msg.control {
        Some((k, v)) => (Some(k), v),
        None => (None, 0),
    };
    let kind_b = kind_byte(msg.kind, control_kind.map(|k| (k, control_value)));

    let mut frames = Vec::with_capacity(FRAME_COUNT + 1);
    frames.push(Bytes::from_static(PROTOCOL_VERSION));
    frames.push(Bytes::copy_from_slice(&[kind_b]));
    frames.push(Bytes::copy_from_slice(&[msg.flags.bits()]));
    frames.push(Bytes::copy_from_slice(&[msg.role.bits()]));
    frames.push(Bytes::copy_from_slice(&msg.matchtag.to_be_bytes()));
    frames.push(Bytes::copy_from_slice(
        &msg.userid.unwrap_or(u32::MAX).to_be_bytes(),
    ));
    frames.push(Bytes::copy_from_slice(
        &msg.seq.unwrap_or(0).to_be_bytes(),
    ));
    frames.push(Bytes::copy_from_slice(&control_value.to_be_bytes()));
    frames.push(Bytes::copy_from_slice(msg.topic.as_bytes()));
    frames.push(Bytes::copy_from_slice(msg.route.join("\0").as_bytes()));
    frames.push(Bytes::copy_from_slice(&msg.payload));
    frames
}

/// Decode a FLUX01 multipart message. `parts` must not include any ROUTER
/// identity frame(s); strip those first.
pub fn decode(parts: &[Bytes]) -> Result<Message, FrameError> {
    if parts.is_empty() || parts[0].as_ref() != PROTOCOL_VERSION {
        return Err(FrameError::MissingMagic);
    }
    let body = &parts[1..];
    if body.len() != FRAME_COUNT - 1 {
        return Err(FrameError::WrongFrameCount(body.len()));
    }

    let kind_b = *body[0].first().ok_or(FrameError::BadWidth(1))?;
    let (kind, control_kind) = decode_kind_byte(kind_b)?;

    let flags = Flags::from_bits_truncate(*body[1].first().ok_or(FrameError::BadWidth(2))?);
    let role = Role::from_bits_truncate(*body[2].first().ok_or(FrameError::BadWidth(3))?);

    let matchtag = u32::from_be_bytes(
        body[3]
            .as_ref()
            .try_into()
            .map_err(|_| FrameError::BadWidth(4))?,
    );
    let userid_raw = u32::from_be_bytes(
        body[4]
            .as_ref()
            .try_into()
            .map_err(|_| FrameError::BadWidth(5))?,
    );
    let userid = if userid_raw == u32::MAX {
        None
    } else {
        Some(userid_raw)
    };
    let seq_raw = u64::from_be_bytes(
        body[5]
            .as_ref()
            .try_into()
            .map_err(|_| FrameError::BadWidth(6))?,
    );
    let seq = if kind == Kind::Event { Some(seq_raw) } else { None };

    let control_value = i64::from_be_bytes(
        body[6]
            .as_ref()
            .try_into()
            .map_err(|_| FrameError::BadWidth(7))?,
    );
    let control = control_kind.map(|k| (k, control_value));

    let topic = std::str::from_utf8(&body[7])
        .map_err(|_| FrameError::BadTopic)?
        .to_string();

    let route = if body[8].is_empty() {
        Vec::new()
    } else {
        std::str::from_utf8(&body[8])
            .map_err(|_| FrameError::BadRoute)?
            .split('\0')
            .map(str::to_string)
            .collect()
    };

    let payload = body[9].to_vec();

    Ok(Message {
        kind,
        topic,
        matchtag,
        route,
        role,
        userid,
        seq,
        flags,
        control,
        payload,
    })
}

/// Scan a multipart message for the FLUX01 magic frame, returning the
/// identity prefix (ROUTER envelope) and the remaining body frames.
///
/// ROUTER sockets prepend one or more identity frames before the payload;
/// this mirrors the HOOT01 convention of scanning for the magic frame
/// rather than assuming a fixed identity-frame count.
pub fn split_identity_prefix(parts: &[Bytes]) -> (&[Bytes], &[Bytes]) {
    match parts.iter().position(|f| f.as_ref() == PROTOCOL_VERSION) {
        Some(idx) => (&parts[..idx], &parts[idx..]),
        None => (&[], parts),
    }
}
