//! Server-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass der Server ohne Konfigurationsdatei
//! lauffaehig ist.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Vollstaendige Server-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// STUN-Responder und Health-Check
    pub stun: StunEinstellungen,
    /// WebSocket-Endpunkt und Fan-out
    pub signaling: SignalingEinstellungen,
    /// Logging-Einstellungen
    pub logging: LoggingEinstellungen,
}

/// STUN-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StunEinstellungen {
    pub bind_adresse: String,
    /// UDP-Port fuer Binding-Requests
    pub port: u16,
    /// TCP-Port des Health-Checks
    pub health_port: u16,
}

impl Default for StunEinstellungen {
    fn default() -> Self {
        Self {
            bind_adresse: "0.0.0.0".into(),
            port: 3468,
            health_port: 3560,
        }
    }
}

/// Signaling-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingEinstellungen {
    pub bind_adresse: String,
    pub port: u16,
    /// Service-Namespace aller Identitaeten und Raeume dieses Servers
    pub namespace: String,
    /// Mitglieder pro Fan-out-Seite
    pub seiten_groesse: usize,
    /// Send-Queue pro Verbindung (Nachrichten)
    pub send_queue_groesse: usize,
}

impl Default for SignalingEinstellungen {
    fn default() -> Self {
        Self {
            bind_adresse: "0.0.0.0".into(),
            port: 8080,
            namespace: "treffpunkt".into(),
            seiten_groesse: 1000,
            send_queue_groesse: 64,
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level bzw. Filter-Direktive: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

fn adresse(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Ungueltige Bind-Adresse '{host}:{port}'"))
}

impl ServerConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => {
                let config: Self = toml::from_str(&inhalt)
                    .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
            )),
        }
    }

    /// UDP-Adresse des STUN-Responders
    pub fn stun_bind_adresse(&self) -> anyhow::Result<SocketAddr> {
        adresse(&self.stun.bind_adresse, self.stun.port)
    }

    /// TCP-Adresse des Health-Checks
    pub fn health_bind_adresse(&self) -> anyhow::Result<SocketAddr> {
        adresse(&self.stun.bind_adresse, self.stun.health_port)
    }

    /// TCP-Adresse des WebSocket-Endpunkts
    pub fn signaling_bind_adresse(&self) -> anyhow::Result<SocketAddr> {
        adresse(&self.signaling.bind_adresse, self.signaling.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_config_ist_valide() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.stun.port, 3468);
        assert_eq!(cfg.stun.health_port, 3560);
        assert_eq!(cfg.signaling.seiten_groesse, 1000);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn bind_adressen() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.stun_bind_adresse().unwrap().to_string(), "0.0.0.0:3468");
        assert_eq!(cfg.health_bind_adresse().unwrap().to_string(), "0.0.0.0:3560");
        assert_eq!(cfg.signaling_bind_adresse().unwrap().port(), 8080);

        let mut cfg = ServerConfig::default();
        cfg.signaling.bind_adresse = "kein-host".into();
        assert!(cfg.signaling_bind_adresse().is_err());
    }

    #[test]
    fn config_aus_toml_string() {
        let toml = r#"
            [stun]
            port = 3478

            [signaling]
            namespace = "demo"
            seiten_groesse = 250
        "#;
        let cfg: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.stun.port, 3478);
        assert_eq!(cfg.signaling.namespace, "demo");
        assert_eq!(cfg.signaling.seiten_groesse, 250);
        // Nicht angegebene Felder behalten Standardwerte
        assert_eq!(cfg.stun.health_port, 3560);
        assert_eq!(cfg.signaling.send_queue_groesse, 64);
        assert_eq!(cfg.logging.format, "text");
    }

    #[test]
    fn fehlende_datei_ergibt_standardwerte() {
        let cfg = ServerConfig::laden("/nicht/vorhanden/treffpunkt.toml").unwrap();
        assert_eq!(cfg.signaling.port, 8080);
    }
}
