//! STUN Binding (RFC 5389, Teilmenge)
//!
//! Nur Binding-Request und Binding-Response mit (XOR-)MAPPED-ADDRESS.
//!
//! ## Header-Format
//!
//! ```text
//! +--------+--------+--------+--------+
//! | Typ (u16 BE)    | Laenge (u16 BE) |
//! +--------+--------+--------+--------+
//! | Magic Cookie 0x2112A442 (u32 BE)  |
//! +--------+--------+--------+--------+
//! | Transaction-ID (96 Bit)           |
//! +--------+--------+--------+--------+
//! ```
//!
//! Die Laenge zaehlt nur die Attribut-Bytes (ohne die 20 Header-Bytes).

use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{ProtocolError, ProtocolResult};

// ---------------------------------------------------------------------------
// Konstanten
// ---------------------------------------------------------------------------

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const HEADER_LAENGE: usize = 20;

pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_RESPONSE: u16 = 0x0101;

pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILIE_IPV4: u8 = 0x01;
const FAMILIE_IPV6: u8 = 0x02;

/// 96-Bit Transaction-ID
pub type TransactionId = [u8; 12];

/// Erzeugt eine frische zufaellige Transaction-ID
pub fn transaction_id_erzeugen() -> TransactionId {
    rand::random()
}

// ---------------------------------------------------------------------------
// Nachricht
// ---------------------------------------------------------------------------

/// Ein einzelnes TLV-Attribut
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunAttribut {
    pub typ: u16,
    pub wert: Vec<u8>,
}

/// Dekodierte STUN-Nachricht
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub methode: u16,
    pub transaction_id: TransactionId,
    pub attribute: Vec<StunAttribut>,
}

impl StunMessage {
    /// Sucht die gemappte Adresse, XOR-MAPPED-ADDRESS hat Vorrang
    pub fn gemappte_adresse(&self) -> ProtocolResult<Option<SocketAddr>> {
        let xor = self
            .attribute
            .iter()
            .find(|a| a.typ == ATTR_XOR_MAPPED_ADDRESS);
        if let Some(attr) = xor {
            return parse_mapped_address(&attr.wert, true, MAGIC_COOKIE, &self.transaction_id)
                .map(Some);
        }

        match self.attribute.iter().find(|a| a.typ == ATTR_MAPPED_ADDRESS) {
            Some(attr) => {
                parse_mapped_address(&attr.wert, false, MAGIC_COOKIE, &self.transaction_id)
                    .map(Some)
            }
            None => Ok(None),
        }
    }
}

/// Dekodiert eine STUN-Nachricht
///
/// # Fehler
/// - `MalformedMessage` bei weniger als 20 Bytes, falschem Magic-Cookie oder
///   Attributen die ueber das Nachrichtenende hinausragen
pub fn parse(daten: &[u8]) -> ProtocolResult<StunMessage> {
    if daten.len() < HEADER_LAENGE {
        return Err(ProtocolError::malformed(format!(
            "STUN-Nachricht zu kurz: {} Bytes",
            daten.len()
        )));
    }

    let methode = u16::from_be_bytes([daten[0], daten[1]]);
    let laenge = u16::from_be_bytes([daten[2], daten[3]]) as usize;
    let cookie = u32::from_be_bytes([daten[4], daten[5], daten[6], daten[7]]);

    if cookie != MAGIC_COOKIE {
        return Err(ProtocolError::malformed(format!(
            "Falsches Magic-Cookie: {cookie:#010x}"
        )));
    }

    if HEADER_LAENGE + laenge > daten.len() {
        return Err(ProtocolError::malformed(format!(
            "Laengenfeld {laenge} groesser als Nutzdaten {}",
            daten.len() - HEADER_LAENGE
        )));
    }

    let mut transaction_id = [0u8; 12];
    transaction_id.copy_from_slice(&daten[8..HEADER_LAENGE]);

    let attribute = attribute_parsen(&daten[HEADER_LAENGE..HEADER_LAENGE + laenge])?;

    Ok(StunMessage {
        methode,
        transaction_id,
        attribute,
    })
}

/// Dekodiert eine Nachricht und verlangt einen Binding-Request
///
/// Andere Methoden liefern `UnknownMethod`.
pub fn parse_binding_request(daten: &[u8]) -> ProtocolResult<TransactionId> {
    let nachricht = parse(daten)?;
    if nachricht.methode != BINDING_REQUEST {
        return Err(ProtocolError::UnknownMethod(nachricht.methode));
    }
    Ok(nachricht.transaction_id)
}

fn attribute_parsen(mut rest: &[u8]) -> ProtocolResult<Vec<StunAttribut>> {
    let mut attribute = Vec::new();

    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(ProtocolError::malformed("Abgeschnittener Attribut-Header"));
        }
        let typ = u16::from_be_bytes([rest[0], rest[1]]);
        let laenge = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        // Attribute sind auf 4 Bytes aufgefuellt
        let aufgefuellt = (laenge + 3) & !3;

        if rest.len() < 4 + laenge {
            return Err(ProtocolError::malformed(format!(
                "Attribut {typ:#06x} laenger als Nachricht"
            )));
        }

        attribute.push(StunAttribut {
            typ,
            wert: rest[4..4 + laenge].to_vec(),
        });

        rest = &rest[(4 + aufgefuellt).min(rest.len())..];
    }

    Ok(attribute)
}

// ---------------------------------------------------------------------------
// Kodierung
// ---------------------------------------------------------------------------

/// Baut einen Binding-Request ohne Attribute
pub fn build_binding_request(transaction_id: &TransactionId) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_LAENGE);
    buf.put_u16(BINDING_REQUEST);
    buf.put_u16(0);
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(transaction_id);
    buf.to_vec()
}

/// Baut eine Binding-Response mit genau einem XOR-MAPPED-ADDRESS-Attribut
///
/// Das Laengenfeld wird erst nach dem Zusammenbau der Attribute gesetzt.
pub fn build_binding_response(
    transaction_id: &TransactionId,
    beobachtete_ip: Ipv4Addr,
    beobachteter_port: u16,
) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_LAENGE + 12);
    buf.put_u16(BINDING_RESPONSE);
    buf.put_u16(0); // Platzhalter
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(transaction_id);

    let xor_port = beobachteter_port ^ (MAGIC_COOKIE >> 16) as u16;
    let xor_ip = u32::from(beobachtete_ip) ^ MAGIC_COOKIE;

    buf.put_u16(ATTR_XOR_MAPPED_ADDRESS);
    buf.put_u16(8);
    buf.put_u8(0x00);
    buf.put_u8(FAMILIE_IPV4);
    buf.put_u16(xor_port);
    buf.put_u32(xor_ip);

    let attribut_bytes = (buf.len() - HEADER_LAENGE) as u16;
    buf[2..4].copy_from_slice(&attribut_bytes.to_be_bytes());

    buf.to_vec()
}

/// Dekodiert den Wert eines MAPPED-ADDRESS- oder XOR-MAPPED-ADDRESS-Attributs
///
/// 8 Bytes = IPv4, 20 Bytes = IPv6. Bei IPv6 wird mit Cookie und
/// Transaction-ID XOR-verknuepft.
pub fn parse_mapped_address(
    wert: &[u8],
    ist_xor: bool,
    cookie: u32,
    transaction_id: &TransactionId,
) -> ProtocolResult<SocketAddr> {
    let port_roh = match wert.len() {
        8 | 20 => u16::from_be_bytes([wert[2], wert[3]]),
        andere => return Err(ProtocolError::UnexpectedAttributeLength(andere)),
    };
    let port = if ist_xor {
        port_roh ^ (cookie >> 16) as u16
    } else {
        port_roh
    };

    let ip = if wert.len() == 8 {
        if wert[1] != FAMILIE_IPV4 {
            return Err(ProtocolError::malformed(format!(
                "Adressfamilie {:#04x} passt nicht zu 8 Bytes",
                wert[1]
            )));
        }
        let roh = u32::from_be_bytes([wert[4], wert[5], wert[6], wert[7]]);
        IpAddr::V4(Ipv4Addr::from(if ist_xor { roh ^ cookie } else { roh }))
    } else {
        if wert[1] != FAMILIE_IPV6 {
            return Err(ProtocolError::malformed(format!(
                "Adressfamilie {:#04x} passt nicht zu 20 Bytes",
                wert[1]
            )));
        }
        let mut oktette = [0u8; 16];
        oktette.copy_from_slice(&wert[4..20]);
        if ist_xor {
            let mut schluessel = [0u8; 16];
            schluessel[..4].copy_from_slice(&cookie.to_be_bytes());
            schluessel[4..].copy_from_slice(transaction_id);
            for (o, s) in oktette.iter_mut().zip(schluessel.iter()) {
                *o ^= s;
            }
        }
        IpAddr::V6(Ipv6Addr::from(oktette))
    };

    Ok(SocketAddr::new(ip, port))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const TID: TransactionId = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

    #[test]
    fn binding_response_round_trip() {
        let antwort = build_binding_response(&TID, "203.0.113.5".parse().unwrap(), 54321);
        let nachricht = parse(&antwort).expect("Antwort muss dekodierbar sein");

        assert_eq!(nachricht.methode, BINDING_RESPONSE);
        assert_eq!(nachricht.transaction_id, TID);

        let attr = &nachricht.attribute[0];
        assert_eq!(attr.typ, ATTR_XOR_MAPPED_ADDRESS);
        let addr = parse_mapped_address(&attr.wert, true, MAGIC_COOKIE, &TID).unwrap();
        assert_eq!(addr, "203.0.113.5:54321".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn laengenfeld_zaehlt_attribut_bytes() {
        let antwort = build_binding_response(&TID, Ipv4Addr::LOCALHOST, 1);
        let laenge = u16::from_be_bytes([antwort[2], antwort[3]]) as usize;
        assert_eq!(laenge, antwort.len() - HEADER_LAENGE);
        assert_eq!(laenge, 12);
    }

    #[test]
    fn xor_felder_auf_dem_draht() {
        let antwort = build_binding_response(&TID, Ipv4Addr::new(192, 0, 2, 1), 32853);
        // Port 32853 ^ 0x2112 = 0xA147
        assert_eq!(&antwort[26..28], &[0xA1, 0x47]);
        // 192.0.2.1 ^ 0x2112A442 = 0xE112A643
        assert_eq!(&antwort[28..32], &[0xE1, 0x12, 0xA6, 0x43]);
    }

    #[test]
    fn zu_kurze_nachricht() {
        let err = parse(&[0u8; 19]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
    }

    #[test]
    fn falsches_cookie() {
        let mut anfrage = build_binding_request(&TID);
        anfrage[4] = 0xFF;
        assert!(matches!(
            parse(&anfrage),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn binding_request_erkannt() {
        let anfrage = build_binding_request(&TID);
        assert_eq!(anfrage.len(), HEADER_LAENGE);
        assert_eq!(parse_binding_request(&anfrage).unwrap(), TID);
    }

    #[test]
    fn andere_methode_ist_unbekannt() {
        let antwort = build_binding_response(&TID, Ipv4Addr::LOCALHOST, 1);
        assert!(matches!(
            parse_binding_request(&antwort),
            Err(ProtocolError::UnknownMethod(BINDING_RESPONSE))
        ));
    }

    #[test]
    fn plain_mapped_address_ipv4() {
        let wert = [0x00, 0x01, 0x1F, 0x90, 10, 0, 0, 7];
        let addr = parse_mapped_address(&wert, false, MAGIC_COOKIE, &TID).unwrap();
        assert_eq!(addr, "10.0.0.7:8080".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn xor_mapped_address_ipv6() {
        let ziel: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let port: u16 = 4000;

        let mut schluessel = [0u8; 16];
        schluessel[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        schluessel[4..].copy_from_slice(&TID);

        let mut wert = vec![0x00, FAMILIE_IPV6];
        wert.extend_from_slice(&(port ^ 0x2112).to_be_bytes());
        for (o, s) in ziel.octets().iter().zip(schluessel.iter()) {
            wert.push(o ^ s);
        }

        let addr = parse_mapped_address(&wert, true, MAGIC_COOKIE, &TID).unwrap();
        assert_eq!(addr, SocketAddr::new(IpAddr::V6(ziel), port));
    }

    #[test]
    fn unerwartete_attributlaenge() {
        let err = parse_mapped_address(&[0u8; 12], true, MAGIC_COOKIE, &TID).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedAttributeLength(12)));
    }

    #[test]
    fn gemappte_adresse_bevorzugt_xor() {
        let antwort = build_binding_response(&TID, Ipv4Addr::new(198, 51, 100, 9), 6000);
        let mut nachricht = parse(&antwort).unwrap();
        nachricht.attribute.insert(
            0,
            StunAttribut {
                typ: ATTR_MAPPED_ADDRESS,
                wert: vec![0x00, 0x01, 0x00, 0x01, 1, 1, 1, 1],
            },
        );
        let addr = nachricht.gemappte_adresse().unwrap().unwrap();
        assert_eq!(addr, "198.51.100.9:6000".parse::<SocketAddr>().unwrap());
    }
}
