mod common;

use std::net::{TcpListener, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use podium_net::{
    Collaboration, FileLibrary, MemorySettings, NetConfig, NetError, PerformerEvent, Role, SessionEvent,
    SettingsStore, KEY_LAST_SERVER_ADDRESS,
};

/// Fast config with its own discovery port so parallel tests stay apart.
fn isolated_config() -> NetConfig {
    let mut config = common::fast_config();
    config.discovery.port = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    config
}

fn conductor_port(collab: &Collaboration) -> u16 {
    let addr = collab.conductor_addr().expect("conducting");
    addr.rsplit(':').next().unwrap().parse().unwrap()
}

struct Scores(Vec<&'static str>);

impl FileLibrary for Scores {
    fn contains(&self, file: &str) -> bool {
        self.0.iter().any(|f| *f == file)
    }
}

#[test]
fn test_performer_follows_conductor() {
    let config = isolated_config();
    let mut conductor = Collaboration::new(config.clone(), Box::new(MemorySettings::new()));
    let sessions = conductor.activate_conductor("Maestro").unwrap();
    let port = conductor_port(&conductor);

    let mut performer = Collaboration::new(config, Box::new(MemorySettings::new()))
        .with_library(Arc::new(Scores(vec!["bach.pdf"])));
    let events = performer.activate_performer().unwrap();
    performer.connect("127.0.0.1", port, "Oboe").unwrap();

    common::expect_event(&events, Duration::from_secs(2), |e| *e == PerformerEvent::ConnectionStatus(true));
    common::expect_event(&sessions, Duration::from_secs(2), |e| {
        matches!(e, SessionEvent::ClientConnected { .. })
    });
    assert_eq!(conductor.client_count(), 1);
    assert!(performer.is_connected());

    conductor.broadcast_file_change("bach.pdf", 1).unwrap();
    common::expect_event(&events, Duration::from_secs(2), |e| {
        *e == PerformerEvent::FileChange {
            file: "bach.pdf".into(),
            page: 1,
            file_server_url: None,
        }
    });

    conductor.broadcast_page_change(2, "bach.pdf").unwrap();
    common::expect_event(&events, Duration::from_secs(2), |e| {
        *e == PerformerEvent::PageChange {
            page: 2,
            file: "bach.pdf".into(),
        }
    });

    conductor.broadcast_file_change("ravel.pdf", 1).unwrap();
    common::expect_event(&events, Duration::from_secs(2), |e| {
        matches!(e, PerformerEvent::FileNotFound { file, .. } if file == "ravel.pdf")
    });

    conductor.broadcast_back_to_list().unwrap();
    common::expect_event(&events, Duration::from_secs(2), |e| *e == PerformerEvent::BackToList);

    conductor.deactivate();
    common::expect_event(&events, Duration::from_secs(2), |e| *e == PerformerEvent::ConductorShutdown);
    common::expect_event(&events, Duration::from_secs(2), |e| *e == PerformerEvent::ConnectionStatus(false));
}

#[test]
fn test_switching_to_performer_releases_conductor_port() {
    let mut collab = Collaboration::new(isolated_config(), Box::new(MemorySettings::new()));
    collab.activate_conductor("Maestro").unwrap();
    assert_eq!(collab.role(), Role::Conductor);
    assert!(collab.is_server_running());
    let port = conductor_port(&collab);

    collab.activate_performer().unwrap();
    assert_eq!(collab.role(), Role::Performer);
    assert!(!collab.is_server_running());
    assert!(collab.conductor_addr().is_none());
    assert!(TcpListener::bind(("0.0.0.0", port)).is_ok());

    assert!(matches!(
        collab.broadcast_page_change(1, "bach.pdf"),
        Err(NetError::WrongRole { expected: Role::Conductor })
    ));
}

#[test]
fn test_last_address_is_remembered() {
    let config = isolated_config();
    let mut conductor = Collaboration::new(config.clone(), Box::new(MemorySettings::new()));
    conductor.activate_conductor("Maestro").unwrap();
    let port = conductor_port(&conductor);

    let mut performer = Collaboration::new(config, Box::new(MemorySettings::new()));
    assert!(matches!(performer.reconnect_last("Oboe"), Err(NetError::WrongRole { .. })));
    let events = performer.activate_performer().unwrap();
    assert!(!performer.reconnect_last("Oboe").unwrap());

    performer.connect("127.0.0.1", port, "Oboe").unwrap();
    assert_eq!(performer.last_server_address(), Some(format!("127.0.0.1:{}", port)));
    common::expect_event(&events, Duration::from_secs(2), |e| *e == PerformerEvent::ConnectionStatus(true));

    performer.disconnect();
    assert!(!performer.is_connected());
    assert!(performer.reconnect_last("Oboe").unwrap());
    common::expect_event(&events, Duration::from_secs(2), |e| *e == PerformerEvent::ConnectionStatus(true));
    assert!(performer.status_text().contains("connected to 127.0.0.1"));
}

#[test]
fn test_saved_settings_survive_restart() {
    let mut settings = MemorySettings::new();
    settings.set(KEY_LAST_SERVER_ADDRESS, "10.0.0.9:9090").unwrap();
    let mut collab = Collaboration::new(isolated_config(), Box::new(settings));

    collab.activate_performer().unwrap();
    assert_eq!(collab.saved_role(), Role::Performer);
    assert_eq!(collab.last_server_address().as_deref(), Some("10.0.0.9:9090"));
    assert!(!collab.is_connected());
}

#[test]
fn test_performer_discovers_conductor() {
    let config = isolated_config();
    let mut conductor = Collaboration::new(config.clone(), Box::new(MemorySettings::new()));
    conductor.activate_conductor("Maestro").unwrap();
    let port = conductor_port(&conductor);

    let mut performer = Collaboration::new(config, Box::new(MemorySettings::new()));
    let events = performer.activate_performer().unwrap();
    performer.start_discovery().unwrap();

    let found = common::expect_event(&events, Duration::from_secs(2), |e| {
        matches!(e, PerformerEvent::ConductorDiscovered(_))
    });
    let PerformerEvent::ConductorDiscovered(info) = found else { unreachable!() };
    assert_eq!(info.name, "Maestro");
    assert_eq!(info.port, port);

    // Repeated announcements do not produce repeated events.
    std::thread::sleep(Duration::from_millis(200));
    assert!(events
        .try_iter()
        .all(|e| !matches!(e, PerformerEvent::ConductorDiscovered(_))));
    assert_eq!(performer.discovered().len(), 1);

    performer.connect_to(&info, "Oboe").unwrap();
    common::expect_event(&events, Duration::from_secs(2), |e| *e == PerformerEvent::ConnectionStatus(true));
    performer.stop_discovery();
}

#[test]
fn test_discovery_times_out_without_conductor() {
    let mut performer = Collaboration::new(isolated_config(), Box::new(MemorySettings::new()));
    let events = performer.activate_performer().unwrap();
    performer.start_discovery().unwrap();
    common::expect_event(&events, Duration::from_secs(2), |e| *e == PerformerEvent::DiscoveryTimeout);
    assert!(performer.discovered().is_empty());
}
