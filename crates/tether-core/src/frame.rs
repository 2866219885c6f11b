use crate::types::TerminalSize;

// ── ttyd binary frame protocol ─────────────────────────────────────────────
//
// Every message after the handshake is [tag:1][payload...]. The tags are
// ASCII digits, and the same digit means different things per direction.

pub const TAG_INPUT: u8 = b'0'; // client → server: terminal input
pub const TAG_RESIZE: u8 = b'1'; // client → server: resize JSON
pub const TAG_OUTPUT: u8 = b'0'; // server → client: terminal output
pub const TAG_TITLE: u8 = b'1'; // server → client: window title
pub const TAG_PREFERENCES: u8 = b'2'; // server → client: client preferences

/// A decoded server → client frame.
#[derive(Debug, PartialEq, Eq)]
pub enum ServerFrame<'a> {
    /// Raw terminal output. Arbitrary bytes, not necessarily UTF-8.
    Output(&'a [u8]),
    /// New window title.
    Title(&'a str),
    /// Client preferences pushed by the server. Not interpreted.
    Preferences(&'a [u8]),
    /// Any other tag.
    Unknown(u8),
}

/// Decode an inbound frame.
///
/// Returns `None` for frames without a payload and for titles that are not
/// valid UTF-8; both are dropped without error.
pub fn decode(data: &[u8]) -> Option<ServerFrame<'_>> {
    if data.len() < 2 {
        return None;
    }
    let payload = &data[1..];
    match data[0] {
        TAG_OUTPUT => Some(ServerFrame::Output(payload)),
        TAG_TITLE => std::str::from_utf8(payload).ok().map(ServerFrame::Title),
        TAG_PREFERENCES => Some(ServerFrame::Preferences(payload)),
        other => Some(ServerFrame::Unknown(other)),
    }
}

/// Build an INPUT frame.
pub fn encode_input(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + data.len());
    frame.push(TAG_INPUT);
    frame.extend_from_slice(data);
    frame
}

/// Build a RESIZE frame: tag followed by `{"columns":c,"rows":r}`.
pub fn encode_resize(size: TerminalSize) -> Vec<u8> {
    let json = serde_json::json!({ "columns": size.columns, "rows": size.rows }).to_string();
    let mut frame = Vec::with_capacity(1 + json.len());
    frame.push(TAG_RESIZE);
    frame.extend_from_slice(json.as_bytes());
    frame
}

/// Build the one-time handshake text sent right after the socket opens.
///
/// ttyd reads the keys in this order: `AuthToken`, `columns`, `rows`. It is
/// both the insertion and the sorted order, so map ordering cannot change it.
pub fn encode_handshake(token: &str, size: TerminalSize) -> String {
    serde_json::json!({
        "AuthToken": token,
        "columns": size.columns,
        "rows": size.rows,
    })
    .to_string()
}
