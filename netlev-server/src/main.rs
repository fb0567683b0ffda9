//! Supplier-side shuffle server: serves map-output bytes out of the directories named
//! by `INIT_MSG` on the host control channel until `EXIT_MSG`.

use netlev_core::collaborators::InMemoryMofStore;
use netlev_core::commands::{parse_command, Command};
use netlev_core::config::ShuffleConfig;
use netlev_core::reactor::EventLoop;
use netlev_core::server::ServerEngine;
use sloggers::{Config, LoggerConfig};
use std::io::{self, BufRead};
use std::sync::Arc;

fn init_logger() -> slog::Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "info"
destination = "stderr"
"#,
    )
    .expect("built-in logger config must parse");
    config.build_logger().expect("terminal logger must build")
}

/// Registers every regular file under `dir` in `store`, keyed by its path relative to
/// `dir`, mirroring how a map task leaves its spill files under `mapred.local.dir`.
fn load_local_dir(store: &InMemoryMofStore, dir: &str, logger: &slog::Logger) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            slog::warn!(logger, "cannot read local dir"; "dir" => dir, "error" => %e);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match std::fs::read(&path) {
            Ok(bytes) => {
                let key = path.to_string_lossy().into_owned();
                slog::debug!(logger, "loaded mof file"; "path" => &key, "bytes" => bytes.len());
                store.put(key, bytes);
            }
            Err(e) => {
                slog::warn!(logger, "failed to read mof file"; "path" => %path.display(), "error" => %e);
            }
        }
    }
}

fn main() {
    let logger = init_logger();

    let bind_addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:0".to_string());
    let cfg = match std::env::args().nth(2) {
        Some(path) => ShuffleConfig::load_from_file(&path).unwrap_or_else(|e| {
            slog::error!(logger, "failed to load config, using defaults"; "path" => path, "error" => %e);
            ShuffleConfig::default()
        }),
        None => ShuffleConfig::default(),
    };

    let (event_loop, reactor_thread) = EventLoop::start(netlev_core::server::POLL_TIMEOUT, logger.clone())
        .expect("failed to start event loop");
    let mof_store = Arc::new(InMemoryMofStore::new());
    let engine = ServerEngine::new(event_loop, cfg, mof_store.clone(), logger.clone())
        .expect("failed to start server engine");

    let addr = bind_addr.parse().expect("bind address must be a valid socket address");
    let local_addr = engine.listen(addr).expect("failed to bind listener");
    slog::info!(logger, "netlev-server ready"; "addr" => %local_addr);

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                slog::error!(logger, "stdin read error"; "error" => %e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_command(&line) {
            Ok(Command::Init(init)) => {
                slog::info!(logger, "job init"; "job_id" => init.job_id, "num_maps" => init.num_maps);
                for dir in &init.local_dirs {
                    load_local_dir(&mof_store, dir, &logger);
                }
            }
            Ok(Command::Fetch(_)) => {
                slog::debug!(logger, "ignoring FETCH_MSG on supplier control channel");
            }
            Ok(Command::Final) => {
                slog::info!(logger, "job final");
            }
            Ok(Command::Exit) => {
                slog::info!(logger, "exit requested");
                break;
            }
            Err(e) => {
                slog::warn!(logger, "malformed control command, ignoring"; "error" => %e, "line" => line);
            }
        }
    }

    engine.stop();
    reactor_thread.join().expect("event loop thread panicked");
}
