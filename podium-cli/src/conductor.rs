//! Interactive conductor: drive performers from typed commands.

use std::path::Path;

use crossbeam_channel::{select, Receiver};
use podium_net::{Collaboration, NetError, SessionEvent};

const HELP: &str = "\
commands:
  page N [FILE]     turn performers to page N
  file NAME [PAGE]  open a score on every performer
  list              send performers back to their score list
  share NAME PATH   offer a file for download
  unshare NAME      stop offering a file
  clients           show connected performers
  status            show the collaboration state
  quit";

pub fn run(collab: &mut Collaboration, events: Receiver<SessionEvent>) -> Result<(), NetError> {
    match collab.conductor_addr() {
        Some(addr) => println!("conducting on {} (type 'help' for commands)", addr),
        None => println!("conducting (type 'help' for commands)"),
    }

    let lines = crate::stdin_lines();
    let mut current_file = String::new();

    loop {
        select! {
            recv(events) -> event => match event {
                Ok(SessionEvent::ClientConnected { client_id, device_name }) => {
                    println!("+ {} joined ({})", device_name, client_id);
                }
                Ok(SessionEvent::ClientDisconnected { client_id }) => {
                    println!("- {} left", client_id);
                }
                Err(_) => break,
            },
            recv(lines) -> line => {
                let Ok(line) = line else { break };
                if !command(collab, line.trim(), &mut current_file)? {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Returns false on `quit`.
fn command(collab: &mut Collaboration, line: &str, current_file: &mut String) -> Result<bool, NetError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(true);
    };

    match verb {
        "page" => match words.next().and_then(|n| n.parse::<u32>().ok()) {
            Some(page) => {
                if let Some(file) = words.next() {
                    *current_file = file.to_string();
                }
                collab.broadcast_page_change(page, current_file)?;
            }
            None => println!("usage: page N [FILE]"),
        },
        "file" => match words.next() {
            Some(file) => {
                let page = words.next().and_then(|n| n.parse().ok()).unwrap_or(1);
                *current_file = file.to_string();
                collab.broadcast_file_change(file, page)?;
            }
            None => println!("usage: file NAME [PAGE]"),
        },
        "list" => {
            current_file.clear();
            collab.broadcast_back_to_list()?;
        }
        "share" => match (words.next(), words.next()) {
            (Some(name), Some(path)) => {
                if collab.add_file(name, Path::new(path))? {
                    println!("sharing {}", name);
                } else {
                    println!("could not share {}", path);
                }
            }
            _ => println!("usage: share NAME PATH"),
        },
        "unshare" => match words.next() {
            Some(name) => {
                if !collab.remove_file(name)? {
                    println!("{} was not shared", name);
                }
            }
            None => println!("usage: unshare NAME"),
        },
        "clients" => {
            let clients = collab.connected_clients();
            if clients.is_empty() {
                println!("no performers connected");
            }
            for (id, name) in clients {
                println!("  {} {}", id, name);
            }
        }
        "status" => println!("{}", collab.status_text()),
        "help" => println!("{}", HELP),
        "quit" | "exit" => return Ok(false),
        other => println!("unknown command '{}' (try 'help')", other),
    }
    Ok(true)
}
