//! Structured Logging Setup via tracing-subscriber
//!
//! Konfigurierbar per Umgebungsvariable (ueberschreibt die Konfigurationsdatei):
//! - `TP_LOG_LEVEL`: Filter-Direktive (z.B. `info` oder `treffpunkt_signaling=debug`)
//! - `TP_LOG_FORMAT`: `text` oder `json`

use std::str::FromStr;
use tracing_subscriber::{fmt, EnvFilter};

pub const ENV_LOG_LEVEL: &str = "TP_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "TP_LOG_FORMAT";

/// Ausgabeformat der Log-Zeilen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            andere => Err(format!("Unbekanntes Log-Format: {andere}")),
        }
    }
}

/// Aufgeloeste Logging-Einstellungen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEinstellungen {
    pub filter: String,
    pub format: LogFormat,
}

impl LogEinstellungen {
    /// Umgebungsvariablen vor Konfiguration; ungueltige Werte fallen auf
    /// `info` bzw. Text zurueck
    pub fn aufloesen(
        level: &str,
        format: &str,
        env_level: Option<String>,
        env_format: Option<String>,
    ) -> Self {
        let filter = env_level
            .filter(|l| EnvFilter::try_new(l).is_ok())
            .or_else(|| Some(level.to_string()).filter(|l| EnvFilter::try_new(l).is_ok()))
            .unwrap_or_else(|| "info".to_string());

        let format = env_format
            .and_then(|f| f.parse().ok())
            .or_else(|| format.parse().ok())
            .unwrap_or_default();

        Self { filter, format }
    }

    pub fn aus_umgebung(level: &str, format: &str) -> Self {
        Self::aufloesen(
            level,
            format,
            std::env::var(ENV_LOG_LEVEL).ok(),
            std::env::var(ENV_LOG_FORMAT).ok(),
        )
    }
}

/// Initialisiert das Logging-System.
///
/// Liest `TP_LOG_LEVEL` und `TP_LOG_FORMAT` aus der Umgebung. Gibt `false`
/// zurueck wenn bereits ein globaler Subscriber gesetzt war.
pub fn logging_initialisieren(level: &str, format: &str) -> bool {
    let einstellungen = LogEinstellungen::aus_umgebung(level, format);
    let filter = EnvFilter::new(&einstellungen.filter);

    let ergebnis = match einstellungen.format {
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_current_span(true)
            .try_init(),
        LogFormat::Text => fmt().with_env_filter(filter).with_target(true).try_init(),
    };
    ergebnis.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsen() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!(" Text ".parse::<LogFormat>(), Ok(LogFormat::Text));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn umgebung_hat_vorrang() {
        let e = LogEinstellungen::aufloesen(
            "info",
            "text",
            Some("treffpunkt_signaling=debug".into()),
            Some("json".into()),
        );
        assert_eq!(e.filter, "treffpunkt_signaling=debug");
        assert_eq!(e.format, LogFormat::Json);
    }

    #[test]
    fn ungueltige_werte_fallen_zurueck() {
        let e = LogEinstellungen::aufloesen("warn", "yaml", Some("foo=quatsch".into()), Some("xml".into()));
        assert_eq!(e.filter, "warn");
        assert_eq!(e.format, LogFormat::Text);

        let e = LogEinstellungen::aufloesen("foo=quatsch", "json", None, None);
        assert_eq!(e.filter, "info");
        assert_eq!(e.format, LogFormat::Json);
    }
}
