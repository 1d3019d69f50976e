mod conductor;
mod performer;

use std::fs::File;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Receiver;
use podium_net::interfaces;
use podium_net::{Collaboration, DirectoryLibrary, FileIndex, JsonFileSettings, NetConfig, RoleEvents};

const USAGE: &str = "\
usage: podium --conductor [--name NAME] [--file-server]
       podium --performer [--name NAME] [--connect HOST[:PORT] | --discover | --last] [--library DIR]
       podium --restore
options:
       --verbose, -v   debug logging";

fn init_logging(verbose: bool) {
    use simplelog::*;

    let log_level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };

    let log_path = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("podium")
        .join("podium.log");

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = File::create(&log_path)
        .unwrap_or_else(|_| File::create(std::env::temp_dir().join("podium.log")).expect("Cannot create log file"));

    CombinedLogger::init(vec![
        TermLogger::new(LevelFilter::Warn, Config::default(), TerminalMode::Stderr, ColorChoice::Auto),
        WriteLogger::new(log_level, Config::default(), log_file),
    ])
    .expect("Failed to initialize logger");

    log::info!("podium starting (log level: {:?})", log_level);
}

/// Value following `flag`, if present.
fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1).cloned())
}

/// Lines typed on stdin, read on their own thread.
pub fn stdin_lines() -> Receiver<String> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .expect("failed to spawn stdin thread");
    rx
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");
    init_logging(verbose);

    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        return;
    }

    let config = NetConfig::load();
    let name = flag_value(&args, "--name").unwrap_or_else(interfaces::device_name);

    let settings = match JsonFileSettings::default_path() {
        Some(path) => JsonFileSettings::open(path),
        None => JsonFileSettings::open(std::env::temp_dir().join("podium-settings.json")),
    };

    let mut distributor = FileIndex::new(None);
    if args.iter().any(|a| a == "--file-server") {
        if let Some(ip) = interfaces::local_ipv4() {
            distributor = FileIndex::new(Some(format!("http://{}:{}", ip, config.file_server_port)));
        }
    }

    let mut collab = Collaboration::new(config, Box::new(settings)).with_distributor(Box::new(distributor));
    if let Some(dir) = flag_value(&args, "--library") {
        collab = collab.with_library(Arc::new(DirectoryLibrary::new(dir)));
    }

    let result = if args.iter().any(|a| a == "--conductor") {
        collab
            .activate_conductor(&name)
            .and_then(|events| conductor::run(&mut collab, events))
    } else if args.iter().any(|a| a == "--performer") {
        collab.activate_performer().and_then(|events| {
            if let Some(addr) = flag_value(&args, "--connect") {
                performer::connect(&mut collab, &addr, &name)?;
            } else if args.iter().any(|a| a == "--discover") {
                collab.start_discovery()?;
            } else if args.iter().any(|a| a == "--last") && !collab.reconnect_last(&name)? {
                println!("no previous conductor saved");
            }
            performer::run(&mut collab, events, &name)
        })
    } else if args.iter().any(|a| a == "--restore") {
        match collab.restore(&name) {
            Ok(RoleEvents::Conductor(events)) => conductor::run(&mut collab, events),
            Ok(RoleEvents::Performer(events)) => performer::run(&mut collab, events, &name),
            Ok(RoleEvents::None) => {
                println!("no saved collaboration mode");
                Ok(())
            }
            Err(e) => Err(e),
        }
    } else {
        println!("{}", USAGE);
        Ok(())
    };

    drop(collab);
    if let Err(e) = result {
        log::error!("{}", e);
        eprintln!("podium: {}", e);
        std::process::exit(1);
    }
}
