//! Storage-Vertrag fuer Connections und Raum-Zaehler
//!
//! Das Backend ist ein externer Key/Value-Dienst. Die Presence-Logik stuetzt
//! sich nur auf drei Eigenschaften:
//! - atomares Addieren auf Zaehler (nie Lesen-Rechnen-Schreiben)
//! - bedingte Schreibzugriffe ("Datensatz muss existieren")
//! - vorwaerts paginierte Abfragen ueber Fortsetzungs-Tokens
//!
//! Jede Mutation erzeugt eine [`StoreAenderung`] im Aenderungsstrom des
//! Backends. Daraus entstehen die Zaehler-Updates, nicht aus einem zweiten
//! Aufruf des anfragenden Handlers.

use treffpunkt_core::{
    Connection, ConnectionChange, ConnectionId, CounterChange, IdentityId, RoomCounter, RoomId,
    ServiceNamespace,
};

use crate::error::SignalingResult;

/// Eine Ergebnisseite einer paginierten Abfrage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seite<T> {
    pub eintraege: Vec<T>,
    /// Opaker Cursor fuer die naechste Seite (`None` = Ende)
    pub fortsetzung: Option<String>,
}

impl<T> Seite<T> {
    pub fn leer() -> Self {
        Self {
            eintraege: Vec::new(),
            fortsetzung: None,
        }
    }
}

/// Filter fuer die Raum-Auflistung eines Namespaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaumFilter {
    /// Raum-IDs mit diesem Praefix
    Praefix(String),
    /// Raeume mit mindestens so vielen Mitgliedern
    MindestAnzahl(i64),
}

/// Eintrag im Aenderungsstrom des Backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreAenderung {
    Connection(ConnectionChange),
    Zaehler(CounterChange),
}

/// Zugriff auf Connections und Raum-Zaehler
#[allow(async_fn_in_trait)]
pub trait PresenceStore: Send + Sync {
    async fn connection_laden(&self, id: &ConnectionId) -> SignalingResult<Option<Connection>>;

    /// Legt eine Connection an (ueberschreibt eine bestehende gleicher ID)
    async fn connection_anlegen(&self, connection: Connection) -> SignalingResult<()>;

    /// Setzt Raum und Kandidat einer bestehenden Connection
    ///
    /// Vorbedingung: die Connection existiert und gehoert `identitaet` in
    /// `namespace`, sonst `PreconditionFailed`. `raum == None` entfernt Raum
    /// und Kandidat.
    async fn connection_aktualisieren(
        &self,
        id: &ConnectionId,
        namespace: &ServiceNamespace,
        identitaet: &IdentityId,
        raum: Option<RoomId>,
        kandidat: Option<String>,
    ) -> SignalingResult<Connection>;

    /// Loescht eine Connection und liefert das alte Abbild
    async fn connection_loeschen(&self, id: &ConnectionId) -> SignalingResult<Option<Connection>>;

    /// Mitglieder eines Raums, geordnet nach ConnectionId
    async fn mitglieder_abfragen(
        &self,
        namespace: &ServiceNamespace,
        raum: &RoomId,
        limit: usize,
        fortsetzung: Option<&str>,
    ) -> SignalingResult<Seite<Connection>>;

    /// Offene Connections einer Identitaet, geordnet nach ConnectionId
    async fn connections_der_identitaet(
        &self,
        namespace: &ServiceNamespace,
        identitaet: &IdentityId,
        limit: usize,
    ) -> SignalingResult<Vec<Connection>>;

    async fn zaehler_laden(
        &self,
        namespace: &ServiceNamespace,
        raum: &RoomId,
    ) -> SignalingResult<Option<RoomCounter>>;

    /// Addiert `delta` atomar auf den Mitgliederzaehler
    ///
    /// Fehlt der Zaehler, wird er mit `delta` angelegt, ausser
    /// `nur_wenn_vorhanden` ist gesetzt (dann `PreconditionFailed`).
    async fn zaehler_addieren(
        &self,
        namespace: &ServiceNamespace,
        raum: &RoomId,
        delta: i64,
        nur_wenn_vorhanden: bool,
    ) -> SignalingResult<RoomCounter>;

    /// Loescht den Zaehler nur wenn er (noch) 0 ist
    async fn zaehler_loeschen_wenn_null(
        &self,
        namespace: &ServiceNamespace,
        raum: &RoomId,
    ) -> SignalingResult<bool>;

    /// Raeume eines Namespaces, geordnet nach Raum-ID
    async fn raeume_abfragen(
        &self,
        namespace: &ServiceNamespace,
        filter: &RaumFilter,
        limit: usize,
        fortsetzung: Option<&str>,
    ) -> SignalingResult<Seite<RoomCounter>>;
}

/// Maximale Wiederholungen wenn eine leere Seite mit Fortsetzung kommt
pub const LEERE_SEITE_WIEDERHOLUNGEN: usize = 3;

/// Mitglieder-Seite lesen; leere Seiten mit Fortsetzung werden begrenzt
/// wiederholt, weil das Backend Seiten nach Filterung leer liefern kann
pub async fn mitglieder_seite_lesen<S: PresenceStore>(
    store: &S,
    namespace: &ServiceNamespace,
    raum: &RoomId,
    limit: usize,
    fortsetzung: Option<&str>,
) -> SignalingResult<Seite<Connection>> {
    let mut seite = store
        .mitglieder_abfragen(namespace, raum, limit, fortsetzung)
        .await?;

    let mut versuche = 0;
    while seite.eintraege.is_empty() && versuche < LEERE_SEITE_WIEDERHOLUNGEN {
        let Some(token) = seite.fortsetzung.take() else {
            break;
        };
        versuche += 1;
        tracing::debug!(raum = %raum, versuch = versuche, "Leere Seite, frage erneut ab");
        seite = store
            .mitglieder_abfragen(namespace, raum, limit, Some(&token))
            .await?;
    }

    Ok(seite)
}
