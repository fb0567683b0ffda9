//! Reducer-side shuffle client: reads commands off the host control channel on
//! stdin, issues fetches, and reports completions through a recording merge manager
//! until `EXIT_MSG`.

use netlev_core::client::ClientEngine;
use netlev_core::collaborators::RecordingMergeManager;
use netlev_core::commands::{parse_command, Command};
use netlev_core::config::ShuffleConfig;
use netlev_core::reactor::EventLoop;
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

fn main() {
    let logger = init_logger();

    let cfg = match std::env::args().nth(1) {
        Some(path) => ShuffleConfig::load_from_file(&path).unwrap_or_else(|e| {
            slog::error!(logger, "failed to load config, using defaults"; "path" => path, "error" => %e);
            ShuffleConfig::default()
        }),
        None => ShuffleConfig::default(),
    };

    let (event_loop, reactor_thread) = EventLoop::start(netlev_core::client::POLL_TIMEOUT, logger.clone())
        .expect("failed to start event loop");
    let merger = Arc::new(RecordingMergeManager::new());
    let engine = ClientEngine::new(event_loop, cfg, merger, logger.clone()).expect("failed to start client engine");

    slog::info!(logger, "netlev-client ready, reading commands from stdin");

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
            }
            Ok(Command::Fetch(fetch)) => {
                match engine.issue_fetch(&fetch.host, &fetch.job_id, &fetch.map_id, fetch.reduce_id, "", 0, 1) {
                    Ok(freq_handle) => slog::debug!(logger, "fetch issued"; "freq_handle" => freq_handle),
                    Err(e) => slog::warn!(logger, "issue_fetch failed"; "error" => %e),
                }
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
