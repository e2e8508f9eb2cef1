//! WebSocket-Frames (RFC 6455)
//!
//! Es werden nur unfragmentierte Nachrichten gesendet (FIN immer gesetzt).
//!
//! ## Frame-Format
//!
//! ```text
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Laenge (7)  |  erweiterte Laenge (16/64)    |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |  Masking-Key (optional, 4 Bytes)  |  Payload ...              |
//! +-----------------------------------+---------------------------+
//! ```
//!
//! Laengen-Indikator: `<= 125` literal, `126` -> u16 BE, `127` -> u64 BE.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, ProtocolResult};

// ---------------------------------------------------------------------------
// Konstanten
// ---------------------------------------------------------------------------

/// Standard-maximale Payload-Groesse (1 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Kontroll-Frames (Close/Ping/Pong) duerfen hoechstens 125 Bytes tragen
pub const MAX_KONTROLL_PAYLOAD: usize = 125;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;

// ---------------------------------------------------------------------------
// Opcode / Frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn aus_bits(bits: u8) -> ProtocolResult<Self> {
        match bits {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            andere => Err(ProtocolError::UngueltigerOpcode(andere)),
        }
    }

    /// Close, Ping und Pong
    pub fn ist_kontrolle(&self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// Ein einzelner WebSocket-Frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    pub fn neu(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::neu(Opcode::Text, Bytes::from(text.into()))
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::neu(Opcode::Ping, payload)
    }

    /// Pong ohne Payload
    pub fn pong() -> Self {
        Self::neu(Opcode::Pong, Bytes::new())
    }

    /// Close-Frame, optional mit Status-Code (z.B. 1000 = normal)
    pub fn close(code: Option<u16>) -> Self {
        let payload = match code {
            Some(c) => Bytes::copy_from_slice(&c.to_be_bytes()),
            None => Bytes::new(),
        };
        Self::neu(Opcode::Close, payload)
    }

    /// Payload eines Text-Frames als UTF-8
    pub fn als_text(&self) -> ProtocolResult<&str> {
        std::str::from_utf8(&self.payload).map_err(|_| ProtocolError::UngueltigesUtf8)
    }
}

// ---------------------------------------------------------------------------
// Maskierung
// ---------------------------------------------------------------------------

/// Maskierung ausgehender Frames
///
/// RFC 6455 verlangt, dass Clients jeden Frame maskieren und Server nie.
/// `Keine` existiert fuer tolerante Gegenstellen die unmaskierte
/// Client-Frames akzeptieren.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Maskierung {
    /// Frischer zufaelliger 4-Byte-Schluessel pro Frame
    #[default]
    Zufaellig,
    Keine,
}

fn maskieren(daten: &mut [u8], schluessel: [u8; 4]) {
    for (i, b) in daten.iter_mut().enumerate() {
        *b ^= schluessel[i % 4];
    }
}

// ---------------------------------------------------------------------------
// Kodierung
// ---------------------------------------------------------------------------

/// Schreibt einen Frame in `dst`
///
/// # Fehler
/// - `MalformedMessage` wenn ein Kontroll-Frame mehr als 125 Bytes traegt
pub fn encode_frame(
    frame: &Frame,
    masking_key: Option<[u8; 4]>,
    dst: &mut BytesMut,
) -> ProtocolResult<()> {
    let laenge = frame.payload.len();
    if frame.opcode.ist_kontrolle() && laenge > MAX_KONTROLL_PAYLOAD {
        return Err(ProtocolError::malformed(format!(
            "Kontroll-Frame mit {laenge} Bytes Payload"
        )));
    }

    dst.reserve(14 + laenge);
    dst.put_u8(FIN_BIT | frame.opcode as u8);

    let mask_bit = if masking_key.is_some() { MASK_BIT } else { 0 };
    if laenge <= 125 {
        dst.put_u8(mask_bit | laenge as u8);
    } else if laenge <= u16::MAX as usize {
        dst.put_u8(mask_bit | 126);
        dst.put_u16(laenge as u16);
    } else {
        dst.put_u8(mask_bit | 127);
        dst.put_u64(laenge as u64);
    }

    match masking_key {
        Some(schluessel) => {
            dst.put_slice(&schluessel);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            maskieren(&mut dst[start..], schluessel);
        }
        None => dst.put_slice(&frame.payload),
    }

    Ok(())
}

/// Liest einen vollstaendigen Frame aus `src`
///
/// Gibt `Ok(None)` zurueck solange die Bytes fuer Header oder Payload noch
/// nicht vollstaendig im Buffer liegen. Maskierte Frames werden demaskiert.
pub fn decode_frame(src: &mut BytesMut, max_frame_size: usize) -> ProtocolResult<Option<Frame>> {
    if src.len() < 2 {
        return Ok(None);
    }

    let fin = src[0] & FIN_BIT != 0;
    let opcode = Opcode::aus_bits(src[0] & 0x0F)?;
    let maskiert = src[1] & MASK_BIT != 0;
    let indikator = src[1] & 0x7F;

    let laengen_bytes = match indikator {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let mask_bytes = if maskiert { 4 } else { 0 };
    let kopf_laenge = 2 + laengen_bytes + mask_bytes;

    if src.len() < kopf_laenge {
        return Ok(None);
    }

    let laenge: u64 = match indikator {
        126 => u16::from_be_bytes([src[2], src[3]]) as u64,
        127 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&src[2..10]);
            u64::from_be_bytes(b)
        }
        n => n as u64,
    };

    if laenge > max_frame_size as u64 {
        return Err(ProtocolError::FrameZuGross {
            laenge,
            maximum: max_frame_size,
        });
    }
    if opcode.ist_kontrolle() && laenge > MAX_KONTROLL_PAYLOAD as u64 {
        return Err(ProtocolError::malformed(format!(
            "Kontroll-Frame mit {laenge} Bytes Payload"
        )));
    }

    let laenge = laenge as usize;
    let gesamt = kopf_laenge + laenge;
    if src.len() < gesamt {
        src.reserve(gesamt - src.len());
        return Ok(None);
    }

    let schluessel = if maskiert {
        let s = 2 + laengen_bytes;
        Some([src[s], src[s + 1], src[s + 2], src[s + 3]])
    } else {
        None
    };

    src.advance(kopf_laenge);
    let mut payload = src.split_to(laenge);
    if let Some(schluessel) = schluessel {
        maskieren(&mut payload, schluessel);
    }

    Ok(Some(Frame {
        fin,
        opcode,
        payload: payload.freeze(),
    }))
}

// ---------------------------------------------------------------------------
// WsFrameCodec
// ---------------------------------------------------------------------------

/// tokio-util Codec fuer WebSocket-Frames
///
/// Implementiert `Encoder<Frame>` und `Decoder` fuer die Integration mit
/// `tokio_util::codec::Framed`. Ein Client-Codec maskiert standardmaessig,
/// ein Server-Codec (`fuer_server`) nie.
#[derive(Debug, Clone)]
pub struct WsFrameCodec {
    max_frame_size: usize,
    maskierung: Maskierung,
}

impl WsFrameCodec {
    /// Codec fuer die Client-Rolle (maskiert)
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            maskierung: Maskierung::Zufaellig,
        }
    }

    /// Codec fuer die Server-Rolle (unmaskiert)
    pub fn fuer_server() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            maskierung: Maskierung::Keine,
        }
    }

    pub fn with_maskierung(mut self, maskierung: Maskierung) -> Self {
        self.maskierung = maskierung;
        self
    }

    pub fn with_max_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn maskierung(&self) -> Maskierung {
        self.maskierung
    }
}

impl Default for WsFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WsFrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src, self.max_frame_size)
    }
}

impl Encoder<Frame> for WsFrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > self.max_frame_size {
            return Err(ProtocolError::FrameZuGross {
                laenge: item.payload.len() as u64,
                maximum: self.max_frame_size,
            });
        }
        let schluessel = match self.maskierung {
            Maskierung::Zufaellig => Some(rand::random::<[u8; 4]>()),
            Maskierung::Keine => None,
        };
        encode_frame(&item, schluessel, dst)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(codec: &mut WsFrameCodec, frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        let decoded = codec
            .decode(&mut buf)
            .unwrap()
            .expect("Frame muss vollstaendig sein");
        assert!(buf.is_empty(), "Buffer muss vollstaendig verbraucht sein");
        decoded
    }

    #[test]
    fn laengen_grenzen_round_trip() {
        for &laenge in &[0usize, 125, 126, 65535, 65536] {
            let text = "x".repeat(laenge);
            for maskierung in [Maskierung::Keine, Maskierung::Zufaellig] {
                let mut codec = WsFrameCodec::new().with_maskierung(maskierung);
                let original = Frame::text(text.clone());
                let decoded = round_trip(&mut codec, original.clone());
                assert_eq!(decoded, original, "Laenge {laenge}, {maskierung:?}");
            }
        }
    }

    #[test]
    fn laengen_indikator_auf_dem_draht() {
        let faelle: [(usize, u8, usize); 5] = [
            (0, 0, 2),
            (125, 125, 2),
            (126, 126, 4),
            (65535, 126, 4),
            (65536, 127, 10),
        ];
        for (laenge, indikator, kopf) in faelle {
            let mut buf = BytesMut::new();
            encode_frame(&Frame::text("a".repeat(laenge)), None, &mut buf).unwrap();
            assert_eq!(buf[0], 0x81);
            assert_eq!(buf[1], indikator);
            assert_eq!(buf.len(), kopf + laenge);
        }
    }

    #[test]
    fn unmaskiertes_pong_ist_zwei_bytes() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::pong(), None, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x8A, 0x00]);
    }

    #[test]
    fn maskierter_frame_setzt_mask_bit() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::text("hallo"), Some([1, 2, 3, 4]), &mut buf).unwrap();
        assert_eq!(buf[1], 0x80 | 5);
        assert_eq!(&buf[2..6], &[1, 2, 3, 4]);
        assert_eq!(buf[6], b'h' ^ 1);
        assert_ne!(&buf[6..], b"hallo");
    }

    #[test]
    fn unvollstaendiger_frame() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::text("x".repeat(300)), None, &mut buf).unwrap();
        let mut teil = buf.split_to(100);
        let mut codec = WsFrameCodec::fuer_server();
        assert!(codec.decode(&mut teil).unwrap().is_none());

        let mut nur_kopf = BytesMut::from(&[0x81u8][..]);
        assert!(codec.decode(&mut nur_kopf).unwrap().is_none());
    }

    #[test]
    fn mehrere_frames_im_buffer() {
        let mut codec = WsFrameCodec::fuer_server();
        let mut buf = BytesMut::new();
        codec.encode(Frame::text("eins"), &mut buf).unwrap();
        codec.encode(Frame::ping(Bytes::from_static(b"p")), &mut buf).unwrap();
        codec.encode(Frame::close(Some(1000)), &mut buf).unwrap();

        let a = codec.decode(&mut buf).unwrap().unwrap();
        let b = codec.decode(&mut buf).unwrap().unwrap();
        let c = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(a.als_text().unwrap(), "eins");
        assert_eq!(b.opcode, Opcode::Ping);
        assert_eq!(c.opcode, Opcode::Close);
        assert_eq!(&c.payload[..], &1000u16.to_be_bytes());
        assert!(buf.is_empty());
    }

    #[test]
    fn ablehnung_zu_grosser_frame() {
        let mut codec = WsFrameCodec::fuer_server().with_max_size(100);
        let mut buf = BytesMut::new();
        encode_frame(&Frame::text("x".repeat(200)), None, &mut buf).unwrap();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameZuGross { laenge: 200, .. })
        ));
    }

    #[test]
    fn ablehnung_grosser_kontroll_frame() {
        let mut buf = BytesMut::new();
        let ping = Frame::ping(Bytes::from(vec![0u8; 126]));
        assert!(encode_frame(&ping, None, &mut buf).is_err());
    }

    #[test]
    fn unbekannter_opcode() {
        let mut buf = BytesMut::from(&[0x83u8, 0x00][..]);
        assert!(matches!(
            decode_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE),
            Err(ProtocolError::UngueltigerOpcode(0x3))
        ));
    }
}
