//! Integration-Test: zwei Peers ueber den WebSocket-Endpunkt (Loopback)

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use treffpunkt_core::{IdentityId, RoomId, ServiceNamespace};
use treffpunkt_protocol::Benachrichtigung;
use treffpunkt_signaling::{
    AenderungsPumpe, ConnectionRegistry, Dispatcher, DownstreamJob, DownstreamWorker,
    FanoutEngine, FanoutJob, KanalEnde, KanalEreignis, MemoryQueue, MemoryStore,
    OpakerTokenVerifier, PresenceEngine, SignalingServer, WsControlChannel,
};

/// Liest Ereignisse bis eines passt (andere werden uebersprungen)
async fn warten_auf<F>(kanal: &mut WsControlChannel, mut passt: F) -> KanalEreignis
where
    F: FnMut(&KanalEreignis) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let ereignis = kanal
                .naechstes_ereignis()
                .await
                .expect("Kanal unerwartet beendet");
            if passt(&ereignis) {
                return ereignis;
            }
        }
    })
    .await
    .expect("Ereignis nicht rechtzeitig empfangen")
}

fn antwort_mit(text: &'static str) -> impl FnMut(&KanalEreignis) -> bool {
    move |e| matches!(e, KanalEreignis::Antwort(a) if a.ist_ok() && a.body == json!(text))
}

fn hinweis(erwartet: Benachrichtigung) -> impl FnMut(&KanalEreignis) -> bool {
    move |e| matches!(e, KanalEreignis::Benachrichtigung(b) if *b == erwartet)
}

#[tokio::test]
async fn zwei_peers_im_selben_raum() {
    let (store, strom) = MemoryStore::neu();
    let registry = ConnectionRegistry::neu();
    let fanout_queue = MemoryQueue::<FanoutJob>::neu();
    let downstream_queue = MemoryQueue::<DownstreamJob>::neu();

    let presence = PresenceEngine::neu(store.clone(), OpakerTokenVerifier::neu(ServiceNamespace::neu("svc")));
    let dispatcher = Arc::new(Dispatcher::neu(presence, registry.clone(), fanout_queue.clone()));
    let server = SignalingServer::binden("127.0.0.1:0".parse().unwrap(), dispatcher)
        .await
        .unwrap();
    let adresse = server.lokale_adresse().unwrap();

    let fanout = FanoutEngine::neu(store.clone(), registry.clone(), fanout_queue.clone());
    let downstream = DownstreamWorker::neu(store.clone(), downstream_queue.clone(), fanout_queue);
    let pumpe = AenderungsPumpe::neu(strom, downstream_queue);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let peers = async move {
        let mut alice = WsControlChannel::verbinden(&format!("ws://{adresse}/?token=alice"))
            .await
            .unwrap();
        let mut bob = WsControlChannel::verbinden(&format!("ws://{adresse}/?token=bob"))
            .await
            .unwrap();

        alice
            .join(RoomId::from("R1"), "alice", Some("198.51.100.1:4000".into()))
            .await
            .unwrap();
        warten_auf(&mut alice, antwort_mit("Joined message group: \"R1\".")).await;

        bob.join(RoomId::from("R1"), "bob", Some("198.51.100.2:4000".into()))
            .await
            .unwrap();
        warten_auf(&mut bob, antwort_mit("Joined message group: \"R1\".")).await;
        warten_auf(
            &mut alice,
            hinweis(Benachrichtigung::beigetreten(
                IdentityId::from("bob"),
                "198.51.100.2:4000",
            )),
        )
        .await;

        // Broadcast an den Raum
        bob.broadcast(RoomId::from("R1"), "bob", json!({"hallo": 1}))
            .await
            .unwrap();
        warten_auf(
            &mut alice,
            hinweis(Benachrichtigung::Nachricht {
                message: json!({"hallo": 1}),
                user_id: IdentityId::from("bob"),
            }),
        )
        .await;

        // Direktnachricht mit Echo
        alice
            .send_message(IdentityId::from("bob"), "alice", json!({"sdp": "angebot"}))
            .await
            .unwrap();
        let privat = Benachrichtigung::Privat {
            private: json!({"sdp": "angebot"}),
            user_id: IdentityId::from("alice"),
        };
        warten_auf(&mut bob, hinweis(privat.clone())).await;
        warten_auf(&mut alice, antwort_mit("Sent message to bob.")).await;

        // Schliessen von bob wird zum "left"-Hinweis fuer alice
        assert_eq!(bob.schliessen().await, KanalEnde::Lokal);
        warten_auf(
            &mut alice,
            hinweis(Benachrichtigung::verlassen(IdentityId::from("bob"))),
        )
        .await;

        alice.schliessen().await;
        shutdown_tx.send(true).unwrap();
    };

    let (ergebnis, (), (), (), ()) = tokio::join!(
        server.starten(shutdown_rx.clone()),
        fanout.starten(shutdown_rx.clone()),
        downstream.starten(shutdown_rx.clone()),
        pumpe.starten(shutdown_rx),
        peers,
    );
    ergebnis.unwrap();
}
