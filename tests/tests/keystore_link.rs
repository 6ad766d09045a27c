//! Key-store link scenarios: handshake, LOAD mirroring, wire tampering,
//! persistence, and the full TCP link task.

use parking_lot::Mutex;
use q3p_keystore::engine::link::Link;
use q3p_keystore::ports::KeyStoreBackend;
use q3p_keystore::{DataSink, DbProfile, Engine, EngineConfig, EngineState, ProtocolError};
use qkd_link_tests::{init_tracing, key_material};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<Vec<u8>>>>);

impl DataSink for SharedSink {
    fn recv_data(&mut self, data: &[u8]) {
        self.0.lock().push(data.to_vec());
    }
}

fn config(prefer_master: bool) -> EngineConfig {
    EngineConfig {
        common_profile: DbProfile::new(128, 1, 512),
        buffer_profile: DbProfile::new(32, 1, 256),
        prefer_master,
        prefer_slave: !prefer_master,
        ..Default::default()
    }
}

/// Two attached engines pumping frames in process until quiet.
fn linked_pair() -> (Engine, Engine) {
    let mut alice = Engine::new(config(true));
    let mut bob = Engine::new(config(false));
    alice.open_db("ram://common-alice").unwrap();
    bob.open_db("ram://common-bob").unwrap();

    let material = key_material(16 * 128, 9);
    alice.inject(&material).unwrap();
    bob.inject(&material).unwrap();

    let secret = key_material(32 + 2 * 320, 5);
    alice.set_initial_secret(secret.clone()).unwrap();
    bob.set_initial_secret(secret).unwrap();
    alice.transport_attached().unwrap();
    bob.transport_attached().unwrap();
    pump(&mut alice, &mut bob);
    (alice, bob)
}

fn pump(alice: &mut Engine, bob: &mut Engine) {
    for _ in 0..32 {
        let from_alice = alice.take_outbox();
        let from_bob = bob.take_outbox();
        if from_alice.is_empty() && from_bob.is_empty() {
            break;
        }
        for frame in from_alice {
            let _ = bob.handle_frame(&frame, Instant::now());
        }
        for frame in from_bob {
            let _ = alice.handle_frame(&frame, Instant::now());
        }
    }
}

fn snapshot(db: &q3p_keystore::KeyDb) -> Vec<(u64, Vec<u8>)> {
    (db.min_id()..=db.max_id())
        .filter(|&id| db.valid(id))
        .map(|id| (id, db.get(id).data.as_octets().to_vec()))
        .collect()
}

#[test]
fn test_buffers_mirror_across_the_link() {
    init_tracing();
    let (mut alice, mut bob) = linked_pair();
    assert!(alice.connected() && bob.connected());
    assert!(alice.master() ^ bob.master());

    let sink = SharedSink::default();
    bob.set_data_sink(Box::new(sink.clone()));
    alice.send_data(b"drain a little").unwrap();
    pump(&mut alice, &mut bob);

    // slave asks, master loads, both commit the identical move
    bob.tick(Instant::now());
    pump(&mut alice, &mut bob);

    assert_eq!(
        snapshot(alice.outgoing_buffer().unwrap()),
        snapshot(bob.incoming_buffer().unwrap()),
    );
    assert_eq!(
        snapshot(alice.incoming_buffer().unwrap()),
        snapshot(bob.outgoing_buffer().unwrap()),
    );
    assert_eq!(
        snapshot(alice.application_buffer().unwrap()),
        snapshot(bob.application_buffer().unwrap()),
    );
    assert_eq!(
        snapshot(alice.common_store().unwrap()),
        snapshot(bob.common_store().unwrap()),
    );
}

#[test]
fn test_data_payloads_arrive_in_order() {
    init_tracing();
    let (mut alice, mut bob) = linked_pair();
    let sink = SharedSink::default();
    bob.set_data_sink(Box::new(sink.clone()));

    alice.send_data(b"first").unwrap();
    alice.send_data(b"second").unwrap();
    pump(&mut alice, &mut bob);

    let received = sink.0.lock();
    assert_eq!(
        received.as_slice(),
        &[b"first".to_vec(), b"second".to_vec()]
    );
}

/// Scenario: one flipped bit on the wire. The receiver reports an
/// authentication failure, poisons the link and will not reconnect.
#[test]
fn test_tampered_frame_tears_the_link_down() {
    init_tracing();
    let (mut alice, mut bob) = linked_pair();
    let sink = SharedSink::default();
    bob.set_data_sink(Box::new(sink.clone()));

    alice.send_data(b"target payload").unwrap();
    let mut frames = alice.take_outbox();
    assert_eq!(frames.len(), 1);
    let frame = &mut frames[0];
    let flip_at = frame.len() - 24; // inside payload or tag either way
    frame[flip_at] ^= 0x01;

    let err = bob.handle_frame(frame, Instant::now()).unwrap_err();
    assert!(matches!(err, ProtocolError::Auth(_)));
    assert!(bob.auth_poisoned());
    assert_eq!(bob.state(), EngineState::Open);
    assert!(sink.0.lock().is_empty());
}

#[test]
fn test_transport_loss_rolls_back_to_open() {
    init_tracing();
    let (mut alice, mut bob) = linked_pair();
    alice.transport_lost();
    assert_eq!(alice.state(), EngineState::Open);
    assert!(!alice.auth_poisoned());

    // the other side keeps its view until its own transport fails
    assert!(bob.connected());
    bob.transport_lost();
    assert_eq!(bob.state(), EngineState::Open);
}

#[test]
fn test_file_backed_common_store_survives_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let url = format!("file://{}/common.db", dir.path().display());

    {
        let mut engine = Engine::new(config(true));
        engine.open_db(&url).unwrap();
        engine.inject(&key_material(4 * 128, 21)).unwrap();
        assert_eq!(engine.common_store().unwrap().count(), 4);
        engine.close_db();
    }

    let mut engine = Engine::new(config(true));
    engine.open_db(&url).unwrap();
    let store = engine.common_store().unwrap();
    assert_eq!(store.count(), 4);
    for id in 1..=4u64 {
        assert!(store.valid(id));
    }
}

/// The full shell: two engines, a real TCP loopback link, the periodic
/// tick, and a DATA payload end to end.
#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_link_end_to_end() {
    init_tracing();

    let fast = |prefer_master: bool| EngineConfig {
        tick_interval: Duration::from_millis(50),
        ..config(prefer_master)
    };

    let alice = Arc::new(Mutex::new(Engine::new(fast(true))));
    let bob = Arc::new(Mutex::new(Engine::new(fast(false))));
    let sink = SharedSink::default();

    let material = key_material(16 * 128, 9);
    let secret = key_material(32 + 2 * 320, 5);
    {
        let mut locked = alice.lock();
        locked.open_db("ram://tcp-alice").unwrap();
        locked.inject(&material).unwrap();
    }
    {
        let mut locked = bob.lock();
        locked.open_db("ram://tcp-bob").unwrap();
        locked.inject(&material).unwrap();
        locked.set_data_sink(Box::new(sink.clone()));
    }

    let (listener, addr) = Link::listen(bob.clone(), "tcp://127.0.0.1:0", secret.clone())
        .await
        .unwrap();
    let connector = Link::connect(
        alice.clone(),
        &format!("tcp://127.0.0.1:{}", addr.port()),
        secret,
    )
    .await
    .unwrap();

    // wait for the handshake to settle
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if alice.lock().connected() && bob.lock().connected() {
            break;
        }
        assert!(Instant::now() < deadline, "link never came up");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    alice.lock().send_data(b"across real sockets").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if !sink.0.lock().is_empty() {
            break;
        }
        assert!(Instant::now() < deadline, "payload never arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(sink.0.lock().as_slice(), &[b"across real sockets".to_vec()]);

    connector.shutdown().await;
    listener.shutdown().await;
}
