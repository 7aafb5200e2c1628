//! Raw RSP framing: `$payload#checksum`, and the stop-reply/data-packet split.

/// Stop-reply payloads begin with one of these bytes. The literal payload
/// `OK` is excluded even though it starts with `O`, since it's an
/// acknowledgement reply, not a stop notification.
const STOP_REPLY_LEAD_BYTES: &[u8] = b"STWwNOF";

/// Compute the RSP checksum of a payload: the sum of its bytes mod 256.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Frame `payload` as `$payload#cc`, with `cc` the two lowercase hex
/// checksum digits.
pub fn make_packet(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + 4);
    framed.push(b'$');
    framed.extend_from_slice(payload);
    framed.push(b'#');
    framed.extend_from_slice(crate::hex::hexbyte(checksum(payload)).as_bytes());
    framed
}

/// A payload is a stop-reply iff it is non-empty, its first byte is one of
/// the stop codes, and it isn't the literal string `OK`.
pub fn is_stop_reply(payload: &[u8]) -> bool {
    match payload.first() {
        Some(b) if STOP_REPLY_LEAD_BYTES.contains(b) => payload != b"OK",
        _ => false,
    }
}

/// Scan `buf` for the first complete `$...#cc` frame, returning the payload
/// (sans `$`/`#cc`) and the index just past the consumed frame. Bytes
/// preceding the first `$` are considered garbage and are reported as
/// consumed too, so the caller can discard them.
///
/// Returns `None` if `buf` does not yet contain a complete frame.
pub fn extract_frame(buf: &[u8]) -> Option<(Vec<u8>, usize)> {
    let start = buf.iter().position(|&b| b == b'$')?;
    let rest = &buf[start + 1..];
    let hash = rest.iter().position(|&b| b == b'#')?;
    // need two checksum digits after '#'
    if rest.len() < hash + 3 {
        return None;
    }
    let payload = rest[..hash].to_vec();
    let consumed = start + 1 + hash + 3;
    Some((payload, consumed))
}
