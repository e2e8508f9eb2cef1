//! treffpunkt-server – Bibliotheks-Root
//!
//! Verdrahtet STUN-Responder, WebSocket-Endpunkt und die Hintergrund-Worker
//! (Aenderungspumpe, Downstream, Fan-out) zu einem lauffaehigen Server.

pub mod config;
pub mod peer;

use anyhow::{Context, Result};
use config::ServerConfig;
use std::sync::Arc;
use tokio::sync::watch;
use treffpunkt_core::ServiceNamespace;
use treffpunkt_signaling::{
    AenderungsPumpe, ConnectionRegistry, Dispatcher, DownstreamJob, DownstreamWorker,
    FanoutEngine, FanoutJob, MemoryQueue, MemoryStore, OpakerTokenVerifier, PresenceEngine,
    SignalingServer,
};
use treffpunkt_stun::{HealthListener, StunResponder};

/// Haelt den laufenden Server-Zustand zusammen
pub struct Server {
    pub config: ServerConfig,
}

impl Server {
    /// Erstellt einen neuen Server aus der gegebenen Konfiguration
    pub fn neu(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Startet alle Subsysteme und laeuft bis zum Shutdown-Signal
    ///
    /// Reihenfolge:
    /// 1. Store und Job-Queues anlegen
    /// 2. WebSocket-Endpunkt binden
    /// 3. STUN-Socket und Health-Listener binden
    /// 4. Alle Loops gemeinsam treiben bis Ctrl-C
    pub async fn starten(self) -> Result<()> {
        let stun_addr = self.config.stun_bind_adresse()?;
        let health_addr = self.config.health_bind_adresse()?;
        let signaling_addr = self.config.signaling_bind_adresse()?;
        let einstellungen = &self.config.signaling;

        tracing::info!(
            namespace = %einstellungen.namespace,
            stun = %stun_addr,
            health = %health_addr,
            signaling = %signaling_addr,
            "Server startet"
        );

        let (store, strom) = MemoryStore::neu();
        let registry = ConnectionRegistry::mit_queue_groesse(einstellungen.send_queue_groesse);
        let fanout_queue = MemoryQueue::<FanoutJob>::neu();
        let downstream_queue = MemoryQueue::<DownstreamJob>::neu();

        let verifier = OpakerTokenVerifier::neu(ServiceNamespace::neu(&einstellungen.namespace));
        let presence = PresenceEngine::neu(store.clone(), verifier);
        let dispatcher = Arc::new(Dispatcher::neu(
            presence,
            registry.clone(),
            fanout_queue.clone(),
        ));

        let signaling = SignalingServer::binden(signaling_addr, dispatcher)
            .await
            .with_context(|| format!("WebSocket-Endpunkt {signaling_addr} nicht bindbar"))?;
        let fanout = FanoutEngine::neu(store.clone(), registry, fanout_queue.clone())
            .with_seiten_groesse(einstellungen.seiten_groesse);
        let downstream = DownstreamWorker::neu(store, downstream_queue.clone(), fanout_queue);
        let pumpe = AenderungsPumpe::neu(strom, downstream_queue);

        let stun = StunResponder::binden(stun_addr)
            .await
            .with_context(|| format!("STUN-Socket {stun_addr} nicht bindbar"))?;
        let health = HealthListener::binden(health_addr)
            .await
            .with_context(|| format!("Health-Listener {health_addr} nicht bindbar"))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let signal = async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutdown-Signal empfangen, Server wird beendet"),
                Err(e) => tracing::error!(fehler = %e, "Signal-Handler fehlgeschlagen, beende"),
            }
            let _ = shutdown_tx.send(true);
        };

        tracing::info!("Server laeuft. Warte auf Shutdown-Signal (Ctrl-C)...");
        let (endpunkt, (), (), (), (), (), ()) = tokio::join!(
            signaling.starten(shutdown_rx.clone()),
            fanout.starten(shutdown_rx.clone()),
            downstream.starten(shutdown_rx.clone()),
            pumpe.starten(shutdown_rx.clone()),
            stun.empfangs_loop_starten(shutdown_rx.clone()),
            health.starten(shutdown_rx),
            signal,
        );
        endpunkt.context("WebSocket-Endpunkt abgebrochen")?;

        tracing::info!("Server beendet");
        Ok(())
    }
}
