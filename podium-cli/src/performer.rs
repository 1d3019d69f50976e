//! Follow a conductor and print what it asks for.

use crossbeam_channel::{select, Receiver};
use podium_net::{parse_host_port, Collaboration, NetError, PerformerEvent};

pub fn connect(collab: &mut Collaboration, addr: &str, name: &str) -> Result<(), NetError> {
    let (host, port) = parse_host_port(addr, collab.config().server.port)?;
    println!("connecting to {}:{}", host, port);
    collab.connect(&host, port, name)
}

pub fn run(collab: &mut Collaboration, events: Receiver<PerformerEvent>, name: &str) -> Result<(), NetError> {
    println!("performing as {} (commands: sync, discover, status, quit)", name);
    let lines = crate::stdin_lines();

    loop {
        select! {
            recv(events) -> event => {
                let Ok(event) = event else { break };
                on_event(collab, event, name)?;
            }
            recv(lines) -> line => {
                let Ok(line) = line else { break };
                match line.trim() {
                    "" => {}
                    "sync" => {
                        if !collab.request_sync() {
                            println!("not connected");
                        }
                    }
                    "discover" => collab.start_discovery()?,
                    "status" => {
                        println!("{}", collab.status_text());
                        if let Some(stats) = collab.queue_stats() {
                            println!(
                                "queue: {} waiting, {} processed, {} dropped, {} retried",
                                stats.queue_size, stats.total_processed, stats.total_dropped, stats.total_retried
                            );
                        }
                    }
                    "quit" | "exit" => break,
                    other => println!("unknown command '{}'", other),
                }
            }
        }
    }
    Ok(())
}

fn on_event(collab: &mut Collaboration, event: PerformerEvent, name: &str) -> Result<(), NetError> {
    match event {
        PerformerEvent::ConnectionStatus(true) => println!("connected"),
        PerformerEvent::ConnectionStatus(false) => println!("disconnected"),
        PerformerEvent::ConnectFailed => println!("could not reach the conductor"),
        PerformerEvent::PageChange { page, file } => println!("page {} of {}", page, file),
        PerformerEvent::FileChange { file, page, .. } => println!("open {} at page {}", file, page),
        PerformerEvent::FileNotFound { file, file_server_url } => match file_server_url {
            Some(url) => println!("missing {} (available from {})", file, url),
            None => println!("missing {}", file),
        },
        PerformerEvent::BackToList => println!("back to score list"),
        PerformerEvent::ConductorDiscovered(info) => {
            println!("found conductor {} at {}", info.name, info.address());
            if !collab.is_connected() {
                collab.connect_to(&info, name)?;
            }
        }
        PerformerEvent::DiscoveryTimeout => println!("no conductor found"),
        PerformerEvent::ConductorShutdown => println!("conductor stopped"),
        PerformerEvent::QueueStats(stats) => log::debug!("queue stats: {:?}", stats),
    }
    Ok(())
}
