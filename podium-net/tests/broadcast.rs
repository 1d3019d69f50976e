mod common;

use std::net::SocketAddr;
use std::time::Duration;

use podium_net::{Action, ControlMessage, FileIndex, SessionEvent, SessionManager, Status};

fn start(name: &str) -> (SessionManager, crossbeam_channel::Receiver<SessionEvent>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let manager = SessionManager::start(common::fast_config().server, name, tx).unwrap();
    (manager, rx)
}

fn addr(manager: &SessionManager) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], manager.port()))
}

#[test]
fn test_connect_response_carries_conductor_state() {
    let (manager, rx) = start("Maestro");
    manager.broadcast_file_change("bach.pdf", 3).unwrap().join().unwrap();

    let mut oboe = common::RawWsClient::connect(addr(&manager)).unwrap();
    let response = oboe.join("Oboe");
    assert_eq!(response.action, Action::ConnectResponse);
    assert_eq!(response.status, Some(Status::Success));
    assert_eq!(response.master_id.as_deref(), Some("Maestro"));
    assert_eq!(response.current_file.as_deref(), Some("bach.pdf"));
    assert_eq!(response.current_page, Some(3));
    assert!(response.client_id.is_some());

    let event = common::expect_event(&rx, Duration::from_secs(2), |_| true);
    assert!(matches!(
        event,
        SessionEvent::ClientConnected { ref device_name, .. } if device_name == "Oboe"
    ));
    assert_eq!(manager.client_count(), 1);
    assert_eq!(manager.connected_clients()[0].1, "Oboe");
}

#[test]
fn test_page_change_reaches_every_performer() {
    let (manager, _rx) = start("Maestro");
    let mut oboe = common::RawWsClient::connect(addr(&manager)).unwrap();
    let mut flute = common::RawWsClient::connect(addr(&manager)).unwrap();
    oboe.join("Oboe");
    flute.join("Flute");
    common::wait_for(Duration::from_secs(2), "two sessions", || manager.client_count() == 2);

    let delivered = manager.broadcast_page_change(12, "bach.pdf").unwrap().join().unwrap();
    assert_eq!(delivered, 2);

    for performer in [&mut oboe, &mut flute] {
        let message = performer.recv();
        assert_eq!(message.action, Action::PageChange);
        assert_eq!(message.page, Some(12));
        assert_eq!(message.file.as_deref(), Some("bach.pdf"));
    }
    assert_eq!(manager.current_page(), Some(12));
}

#[test]
fn test_back_to_back_broadcasts_arrive_in_order() {
    let (manager, _rx) = start("Maestro");
    let mut oboe = common::RawWsClient::connect(addr(&manager)).unwrap();
    oboe.join("Oboe");
    common::wait_for(Duration::from_secs(2), "session", || manager.client_count() == 1);

    let handles: Vec<_> = (1..=50)
        .map(|page| manager.broadcast_page_change(page, "bach.pdf").unwrap())
        .collect();

    let received: Vec<u32> = (1..=50).map(|_| oboe.recv().page.unwrap()).collect();
    assert_eq!(received, (1..=50).collect::<Vec<u32>>());
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 1);
    }
    assert_eq!(manager.current_page(), Some(50));
}

#[test]
fn test_sync_and_heartbeat_are_answered() {
    let (manager, _rx) = start("Maestro");
    let mut oboe = common::RawWsClient::connect(addr(&manager)).unwrap();
    let response = oboe.join("Oboe");
    let client_id = response.client_id.unwrap();

    manager.broadcast_page_change(5, "ravel.pdf").unwrap().join().unwrap();
    assert_eq!(oboe.recv().action, Action::PageChange);

    oboe.send(&ControlMessage::request_sync(client_id.clone(), "Oboe")).unwrap();
    let sync = oboe.recv();
    assert_eq!(sync.action, Action::SyncResponse);
    assert_eq!(sync.current_file.as_deref(), Some("ravel.pdf"));
    assert_eq!(sync.current_page, Some(5));

    oboe.send(&ControlMessage::heartbeat(Some(client_id))).unwrap();
    assert_eq!(oboe.recv().action, Action::HeartbeatResponse);
}

#[test]
fn test_malformed_text_gets_error_reply() {
    let (manager, _rx) = start("Maestro");
    let mut oboe = common::RawWsClient::connect(addr(&manager)).unwrap();
    oboe.join("Oboe");

    oboe.send_text("not json").unwrap();
    let reply = oboe.recv();
    assert_eq!(reply.action, Action::Error);
    assert!(reply.error_message.is_some());
}

#[test]
fn test_disconnect_is_reported() {
    let (manager, rx) = start("Maestro");
    let mut oboe = common::RawWsClient::connect(addr(&manager)).unwrap();
    let client_id = oboe.join("Oboe").client_id.unwrap();
    common::expect_event(&rx, Duration::from_secs(2), |e| {
        matches!(e, SessionEvent::ClientConnected { .. })
    });

    oboe.send(&ControlMessage::client_disconnect(client_id.clone())).unwrap();
    let event = common::expect_event(&rx, Duration::from_secs(2), |e| {
        matches!(e, SessionEvent::ClientDisconnected { .. })
    });
    assert_eq!(event, SessionEvent::ClientDisconnected { client_id });
    assert_eq!(manager.client_count(), 0);
}

#[test]
fn test_file_change_includes_file_server_url() {
    let (mut manager, _rx) = start("Maestro");
    manager.set_distributor(Box::new(FileIndex::new(Some("http://10.0.0.2:8090".into()))));
    let mut oboe = common::RawWsClient::connect(addr(&manager)).unwrap();
    oboe.join("Oboe");

    manager.broadcast_file_change("bach.pdf", 1).unwrap().join().unwrap();
    let message = oboe.recv();
    assert_eq!(message.action, Action::FileChange);
    assert_eq!(message.file_server_url.as_deref(), Some("http://10.0.0.2:8090"));

    manager.broadcast_back_to_list().unwrap().join().unwrap();
    assert_eq!(oboe.recv().action, Action::BackToList);
    assert_eq!(manager.current_file(), None);
}

#[test]
fn test_shutdown_notifies_performers() {
    let (mut manager, _rx) = start("Maestro");
    let mut oboe = common::RawWsClient::connect(addr(&manager)).unwrap();
    oboe.join("Oboe");

    manager.shutdown();
    assert_eq!(oboe.recv().action, Action::ConductorShutdown);
    assert!(!manager.is_running());
    assert_eq!(manager.client_count(), 0);
}
