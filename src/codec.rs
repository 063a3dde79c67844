//! RFB wire codec: pure, stateless builders and parsers for every message
//! this client sends or receives.
//!
//! All multi-byte integers are big-endian per RFC 6143. Grounded on
//! `sorng-vnc::vnc::protocol`/`types` (`PixelFormat::{to,from}_bytes`,
//! `build_*`/`parse_*`), narrowed to the client-side operations spec.md §4.1
//! names plus the `SetEncodings`/`ClientCutText` companions noted in
//! SPEC_FULL.md §4.1.

use serde::{Deserialize, Serialize};
use std::fmt;

// ── Client → Server message type codes (§7.5) ───────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientMessageType {
    SetPixelFormat = 0,
    SetEncodings = 2,
    FramebufferUpdateRequest = 3,
    KeyEvent = 4,
    PointerEvent = 5,
    ClientCutText = 6,
}

// ── Server → Client message type codes (§7.6) ───────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerMessageType {
    FramebufferUpdate = 0,
    SetColourMapEntries = 1,
    Bell = 2,
    ServerCutText = 3,
}

impl ServerMessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::FramebufferUpdate),
            1 => Some(Self::SetColourMapEntries),
            2 => Some(Self::Bell),
            3 => Some(Self::ServerCutText),
            _ => None,
        }
    }
}

// ── Security types (§7.1.2) ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SecurityType {
    None = 1,
    VncAuthentication = 2,
}

impl SecurityType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::None),
            2 => Some(Self::VncAuthentication),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

// ── Pixel format (§7.4) ──────────────────────────────────────────────────

/// RFB pixel format descriptor — 16 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_colour: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The client's default offered format: 32bpp, depth 24, little-endian,
    /// true colour, 255/255/255 maxima, 0/8/16 shifts (spec.md §3).
    pub fn default_client_format() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: false,
            true_colour: true,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 0,
            green_shift: 8,
            blue_shift: 16,
        }
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0] = self.bits_per_pixel;
        buf[1] = self.depth;
        buf[2] = self.big_endian as u8;
        buf[3] = self.true_colour as u8;
        buf[4..6].copy_from_slice(&self.red_max.to_be_bytes());
        buf[6..8].copy_from_slice(&self.green_max.to_be_bytes());
        buf[8..10].copy_from_slice(&self.blue_max.to_be_bytes());
        buf[10] = self.red_shift;
        buf[11] = self.green_shift;
        buf[12] = self.blue_shift;
        // 13..16 = padding
        buf
    }

    pub fn from_bytes(buf: &[u8; 16]) -> Self {
        Self {
            bits_per_pixel: buf[0],
            depth: buf[1],
            big_endian: buf[2] != 0,
            true_colour: buf[3] != 0,
            red_max: u16::from_be_bytes([buf[4], buf[5]]),
            green_max: u16::from_be_bytes([buf[6], buf[7]]),
            blue_max: u16::from_be_bytes([buf[8], buf[9]]),
            red_shift: buf[10],
            green_shift: buf[11],
            blue_shift: buf[12],
        }
    }
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::default_client_format()
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}bpp depth={} {}",
            self.bits_per_pixel,
            self.depth,
            if self.big_endian { "BE" } else { "LE" }
        )
    }
}

// ── ServerInit ────────────────────────────────────────────────────────────

/// Decoded ServerInit record: width, height, pixel format, server name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInit {
    pub width: u16,
    pub height: u16,
    pub pixel_format: PixelFormat,
    pub name: String,
}

/// Parse a ServerInit record. `data` must contain at least the fixed 24-byte
/// header; the name is read from offset 24 for `name_length` bytes (§4.1).
/// Returns `None` if `data` does not yet contain the full variable-length
/// record — callers should keep buffering.
pub fn parse_server_init(data: &[u8]) -> Result<Option<ServerInit>, String> {
    if data.len() < 24 {
        return Ok(None);
    }
    let width = u16::from_be_bytes([data[0], data[1]]);
    let height = u16::from_be_bytes([data[2], data[3]]);

    let mut pf_bytes = [0u8; 16];
    pf_bytes.copy_from_slice(&data[4..20]);
    let pixel_format = PixelFormat::from_bytes(&pf_bytes);

    let name_length = u32::from_be_bytes([data[20], data[21], data[22], data[23]]) as usize;
    if data.len() < 24 + name_length {
        return Ok(None);
    }
    let name = String::from_utf8_lossy(&data[24..24 + name_length]).into_owned();

    Ok(Some(ServerInit {
        width,
        height,
        pixel_format,
        name,
    }))
}

/// Total byte length of a ServerInit record once the name length is known.
pub fn server_init_total_len(name_length: u32) -> usize {
    24 + name_length as usize
}

/// Client pixel format is fixed at the default 32bpp/4-bytes-per-pixel
/// format (Non-goal: "pixel-format conversion beyond negotiating a
/// default" — §1), so a Raw rectangle's body size is always
/// `width * height * 4`.
const CLIENT_BYTES_PER_PIXEL: usize = 4;

/// Determine the total length (type byte included) of a buffered
/// `Connected`-phase message whose body this crate surfaces opaquely
/// (FramebufferUpdate, ServerCutText) — spec.md §9's "parsing their
/// headers and lengths is required even when the body is surfaced
/// opaquely." Returns:
/// - `Ok(Some(len))` once enough bytes are buffered to know the length;
/// - `Ok(None)` if more bytes are needed first;
/// - `Err(detail)` if a FramebufferUpdate rectangle uses a non-Raw
///   encoding, which this client never requests (§1 Non-goal) and so
///   cannot size.
pub fn peek_message_len(data: &[u8]) -> Result<Option<usize>, String> {
    if data.is_empty() {
        return Ok(None);
    }
    match ServerMessageType::from_byte(data[0]) {
        Some(ServerMessageType::FramebufferUpdate) => peek_framebuffer_update_len(data),
        Some(ServerMessageType::ServerCutText) => Ok(peek_server_cut_text_len(data)),
        _ => Ok(None),
    }
}

fn peek_framebuffer_update_len(data: &[u8]) -> Result<Option<usize>, String> {
    if data.len() < 4 {
        return Ok(None);
    }
    let num_rects = u16::from_be_bytes([data[2], data[3]]) as usize;
    let mut offset = 4;
    for _ in 0..num_rects {
        if data.len() < offset + 12 {
            return Ok(None);
        }
        let w = u16::from_be_bytes([data[offset + 4], data[offset + 5]]) as usize;
        let h = u16::from_be_bytes([data[offset + 6], data[offset + 7]]) as usize;
        let encoding = i32::from_be_bytes([
            data[offset + 8],
            data[offset + 9],
            data[offset + 10],
            data[offset + 11],
        ]);
        offset += 12;
        if encoding != ENCODING_RAW {
            return Err(format!("unsupported rectangle encoding {}", encoding));
        }
        offset += w * h * CLIENT_BYTES_PER_PIXEL;
    }
    Ok(Some(offset))
}

fn peek_server_cut_text_len(data: &[u8]) -> Option<usize> {
    if data.len() < 8 {
        return None;
    }
    let len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
    Some(8 + len)
}

// ── Client → Server builders ─────────────────────────────────────────────

/// Build the 1-byte ClientInit message. `shared` = allow other clients.
pub fn write_client_init(shared: bool) -> Vec<u8> {
    vec![shared as u8]
}

/// Build SetPixelFormat (§7.5.1). 1 type + 3 padding + 16 pixel format = 20 bytes.
pub fn write_set_pixel_format(pf: &PixelFormat) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);
    buf.push(ClientMessageType::SetPixelFormat as u8);
    buf.extend_from_slice(&[0, 0, 0]);
    buf.extend_from_slice(&pf.to_bytes());
    buf
}

/// Build SetEncodings (§7.5.2), requesting Raw only — see SPEC_FULL.md §9's
/// Open Question decision in DESIGN.md.
pub fn write_set_encodings(encodings: &[i32]) -> Vec<u8> {
    let count = encodings.len() as u16;
    let mut buf = Vec::with_capacity(4 + encodings.len() * 4);
    buf.push(ClientMessageType::SetEncodings as u8);
    buf.push(0);
    buf.extend_from_slice(&count.to_be_bytes());
    for enc in encodings {
        buf.extend_from_slice(&enc.to_be_bytes());
    }
    buf
}

/// RFB Raw encoding type code.
pub const ENCODING_RAW: i32 = 0;

/// Build FramebufferUpdateRequest (§7.5.3). `incremental`: false = full.
pub fn write_fb_update_request(incremental: bool, x: u16, y: u16, w: u16, h: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    buf.push(ClientMessageType::FramebufferUpdateRequest as u8);
    buf.push(incremental as u8);
    buf.extend_from_slice(&x.to_be_bytes());
    buf.extend_from_slice(&y.to_be_bytes());
    buf.extend_from_slice(&w.to_be_bytes());
    buf.extend_from_slice(&h.to_be_bytes());
    buf
}

/// Build KeyEvent (§7.5.4).
pub fn write_key_event(down: bool, keysym: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.push(ClientMessageType::KeyEvent as u8);
    buf.push(down as u8);
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(&keysym.to_be_bytes());
    buf
}

/// Build PointerEvent (§7.5.5).
pub fn write_pointer_event(mask: u8, x: u16, y: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    buf.push(ClientMessageType::PointerEvent as u8);
    buf.push(mask);
    buf.extend_from_slice(&x.to_be_bytes());
    buf.extend_from_slice(&y.to_be_bytes());
    buf
}

/// Build ClientCutText (§7.5.6) — the send-side companion to the
/// `ServerCutText` event this client already surfaces (SPEC_FULL.md §4.1).
pub fn write_client_cut_text(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut buf = Vec::with_capacity(8 + bytes.len());
    buf.push(ClientMessageType::ClientCutText as u8);
    buf.extend_from_slice(&[0, 0, 0]);
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
    buf
}

// ── Server → Client parsing helpers ──────────────────────────────────────

/// Parse the 4-byte security-result status. 0 = success.
pub fn parse_security_result_status(data: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*data)
}

// ── Keysym mapping (§4.1) ────────────────────────────────────────────────

pub mod keysym {
    pub const BACKSPACE: u32 = 0xff08;
    pub const TAB: u32 = 0xff09;
    pub const RETURN: u32 = 0xff0d;
    pub const ESCAPE: u32 = 0xff1b;
    pub const DELETE: u32 = 0xffff;
    pub const LEFT: u32 = 0xff51;
    pub const UP: u32 = 0xff52;
    pub const RIGHT: u32 = 0xff53;
    pub const DOWN: u32 = 0xff54;
    pub const SPACE: u32 = 0x20;
}

/// Map a named navigation/editing key, or a single printable character, to
/// its X11 keysym. Unknown keys map to `0` and are discarded before
/// emission by the caller (spec.md §4.1).
pub fn key_to_keysym(key: &str) -> u32 {
    match key {
        "Backspace" => keysym::BACKSPACE,
        "Tab" => keysym::TAB,
        "Enter" | "Return" => keysym::RETURN,
        "Escape" => keysym::ESCAPE,
        "Delete" => keysym::DELETE,
        "ArrowLeft" | "Left" => keysym::LEFT,
        "ArrowUp" | "Up" => keysym::UP,
        "ArrowRight" | "Right" => keysym::RIGHT,
        "ArrowDown" | "Down" => keysym::DOWN,
        " " | "Space" => keysym::SPACE,
        _ => {
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if (c as u32) < 0x80 => c as u32,
                _ => 0,
            }
        }
    }
}

// ── Mouse button mask (§4.4) ─────────────────────────────────────────────

pub mod mouse_button {
    pub const LEFT: u8 = 1;
    pub const MIDDLE: u8 = 2;
    pub const RIGHT: u8 = 4;
}
