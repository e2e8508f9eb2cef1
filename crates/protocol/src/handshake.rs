//! WebSocket Opening-Handshake (RFC 6455, Abschnitt 4)
//!
//! Der Handshake ist ein einzelner HTTP/1.1 Request/Response-Austausch.
//! Der Kopf wird Byte fuer Byte bis `\r\n\r\n` gelesen, damit keine
//! Frame-Bytes im Lese-Buffer haengen bleiben und der Stream danach direkt
//! an `Framed` uebergeben werden kann.

use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};

/// Fester GUID aus RFC 6455
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximale Groesse eines Handshake-Kopfs
pub const MAX_KOPF_LAENGE: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// Schluessel
// ---------------------------------------------------------------------------

/// Erzeugt einen frischen `Sec-WebSocket-Key` (16 zufaellige Bytes, base64)
///
/// Muss pro Verbindung neu erzeugt werden.
pub fn client_schluessel_erzeugen() -> String {
    let nonce: [u8; 16] = rand::random();
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// Berechnet `Sec-WebSocket-Accept` = base64(SHA-1(key + GUID))
pub fn accept_token(schluessel: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(schluessel.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// HTTP-Kopf
// ---------------------------------------------------------------------------

/// Geparster HTTP-Kopf (Startzeile + Header)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpKopf {
    pub startzeile: String,
    pub headers: Vec<(String, String)>,
}

impl HttpKopf {
    pub fn parsen(text: &str) -> ProtocolResult<Self> {
        let mut zeilen = text.split("\r\n");
        let startzeile = zeilen
            .next()
            .filter(|z| !z.is_empty())
            .ok_or_else(|| ProtocolError::handshake("Leerer HTTP-Kopf"))?
            .to_string();

        let mut headers = Vec::new();
        for zeile in zeilen {
            if zeile.is_empty() {
                continue;
            }
            let (name, wert) = zeile
                .split_once(':')
                .ok_or_else(|| ProtocolError::handshake(format!("Ungueltige Header-Zeile: {zeile}")))?;
            headers.push((name.trim().to_string(), wert.trim().to_string()));
        }

        Ok(Self {
            startzeile,
            headers,
        })
    }

    /// Header-Wert, Name case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, w)| w.as_str())
    }

    /// Prueft ob ein kommaseparierter Header ein Token enthaelt
    fn header_enthaelt(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .map(|w| w.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }
}

/// Liest einen HTTP-Kopf bis einschliesslich `\r\n\r\n`
pub async fn kopf_lesen<R>(reader: &mut R) -> ProtocolResult<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    loop {
        let byte = reader.read_u8().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ProtocolError::handshake("Verbindung waehrend des Handshakes geschlossen")
            } else {
                ProtocolError::Io(e)
            }
        })?;
        buf.push(byte);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_KOPF_LAENGE {
            return Err(ProtocolError::handshake("HTTP-Kopf zu gross"));
        }
    }
    String::from_utf8(buf).map_err(|_| ProtocolError::handshake("HTTP-Kopf ist kein UTF-8"))
}

// ---------------------------------------------------------------------------
// Client-Seite
// ---------------------------------------------------------------------------

/// Baut den Upgrade-Request des Clients
pub fn anfrage_bauen(host: &str, pfad: &str, schluessel: &str) -> String {
    format!(
        "GET {pfad} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {schluessel}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    )
}

/// Prueft die Server-Antwort auf den Upgrade-Request
///
/// Erfolgreich nur bei Status 101 und passendem `Sec-WebSocket-Accept`.
pub fn antwort_pruefen(antwort: &str, schluessel: &str) -> ProtocolResult<()> {
    let kopf = HttpKopf::parsen(antwort)?;

    let status = kopf.startzeile.split_whitespace().nth(1).unwrap_or("");
    if status != "101" {
        return Err(ProtocolError::handshake(format!(
            "Unerwartete Statuszeile: {}",
            kopf.startzeile
        )));
    }

    let erwartet = accept_token(schluessel);
    match kopf.header("Sec-WebSocket-Accept") {
        Some(wert) if wert == erwartet => Ok(()),
        Some(wert) => Err(ProtocolError::handshake(format!(
            "Sec-WebSocket-Accept stimmt nicht: erwartet {erwartet}, erhalten {wert}"
        ))),
        None => Err(ProtocolError::handshake("Sec-WebSocket-Accept fehlt")),
    }
}

/// Fuehrt den Client-Handshake ueber einen bereits verbundenen Stream aus
pub async fn client_handshake<S>(stream: &mut S, host: &str, pfad: &str) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let schluessel = client_schluessel_erzeugen();
    stream
        .write_all(anfrage_bauen(host, pfad, &schluessel).as_bytes())
        .await?;
    stream.flush().await?;

    let antwort = kopf_lesen(stream).await?;
    antwort_pruefen(&antwort, &schluessel)
}

// ---------------------------------------------------------------------------
// Server-Seite
// ---------------------------------------------------------------------------

/// Geparster Upgrade-Request eines Clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAnfrage {
    pub pfad: String,
    pub query: Vec<(String, String)>,
    pub schluessel: String,
}

impl ServerAnfrage {
    /// Query-Parameter (bereits percent-dekodiert)
    pub fn query_parameter(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, w)| w.as_str())
    }
}

/// Parst und validiert einen Upgrade-Request
pub fn anfrage_parsen(text: &str) -> ProtocolResult<ServerAnfrage> {
    let kopf = HttpKopf::parsen(text)?;

    let mut teile = kopf.startzeile.split_whitespace();
    let methode = teile.next().unwrap_or("");
    let ziel = teile.next().unwrap_or("");
    if methode != "GET" || ziel.is_empty() {
        return Err(ProtocolError::handshake(format!(
            "Ungueltige Request-Zeile: {}",
            kopf.startzeile
        )));
    }

    if !kopf.header_enthaelt("Upgrade", "websocket") {
        return Err(ProtocolError::handshake("Upgrade: websocket fehlt"));
    }
    if !kopf.header_enthaelt("Connection", "upgrade") {
        return Err(ProtocolError::handshake("Connection: Upgrade fehlt"));
    }
    let schluessel = kopf
        .header("Sec-WebSocket-Key")
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ProtocolError::handshake("Sec-WebSocket-Key fehlt"))?
        .to_string();

    let (pfad, query_text) = ziel.split_once('?').unwrap_or((ziel, ""));
    let query = query_text
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|paar| {
            let (n, w) = paar.split_once('=').unwrap_or((paar, ""));
            (prozent_dekodieren(n), prozent_dekodieren(w))
        })
        .collect();

    Ok(ServerAnfrage {
        pfad: pfad.to_string(),
        query,
        schluessel,
    })
}

/// `101 Switching Protocols` fuer einen akzeptierten Request
pub fn antwort_bauen(schluessel: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_token(schluessel)
    )
}

/// Ablehnung des Upgrades mit einfachem Text-Body
pub fn ablehnung_bauen(status: u16, grund: &str) -> String {
    format!(
        "HTTP/1.1 {status} {grund}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {grund}",
        grund.len()
    )
}

/// Liest und validiert den Upgrade-Request (Antwort schreibt der Aufrufer)
pub async fn anfrage_lesen<S>(stream: &mut S) -> ProtocolResult<ServerAnfrage>
where
    S: AsyncRead + Unpin,
{
    let text = kopf_lesen(stream).await?;
    anfrage_parsen(&text)
}

/// Schreibt `101 Switching Protocols`
pub async fn annehmen<S>(stream: &mut S, anfrage: &ServerAnfrage) -> ProtocolResult<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(antwort_bauen(&anfrage.schluessel).as_bytes())
        .await?;
    stream.flush().await?;
    Ok(())
}

/// Schreibt eine Ablehnung (z.B. 400 oder 401)
pub async fn ablehnen<S>(stream: &mut S, status: u16, grund: &str) -> ProtocolResult<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(ablehnung_bauen(status, grund).as_bytes())
        .await?;
    stream.flush().await?;
    Ok(())
}

fn hex_wert(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// `%XX` und `+` dekodieren; ungueltige Sequenzen bleiben stehen
fn prozent_dekodieren(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match (hex_wert(bytes[i + 1]), hex_wert(bytes[i + 2])) {
                    (Some(h), Some(l)) => {
                        out.push(h << 4 | l);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
