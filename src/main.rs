use std::{process, sync::OnceLock, time::Duration};

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use wxbee::{
    config::Config,
    core::{
        record::{Packet, StreamKind},
        service::{Collaborators, PublishService, ServiceError},
    },
    logger::LoggerManager,
    print_error,
};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

/// One line of standard input: `{"kind": "loop", "record": {...}}`.
#[derive(Debug, Deserialize)]
struct Event {
    kind: StreamKind,
    record: Packet,
}

fn feed(service: &mut PublishService, line: &str) -> Result<(), ServiceError> {
    let event: Event = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(e) => {
            warn!("Skipping malformed input line: {e}");
            return Ok(());
        }
    };
    let result = match event.kind {
        StreamKind::Live => service.new_loop_packet(event.record),
        StreamKind::Summary => service.new_archive_record(event.record),
    };
    match result {
        Err(ServiceError::Record(e)) => {
            warn!("Skipping {} record: {e}", event.kind);
            Ok(())
        }
        other => other,
    }
}

#[tokio::main]
async fn main() {
    let cfg = config();
    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting wxbee version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.publish.broker);

    let mut service = match PublishService::start(&cfg.publish, Collaborators::standard()) {
        Ok(service) => service,
        Err(ServiceError::Disabled) => {
            info!("Not enabled, exiting.");
            return;
        }
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut failed = false;
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Err(e) = feed(&mut service, &line) {
                        error!("{e}");
                        failed = true;
                        break;
                    }
                }
                Ok(None) => {
                    info!("End of input, flushing {} queued records...", service.pending());
                    let timeout = Duration::from_secs(cfg.publish.shutdown_timeout);
                    if !service.flush(timeout).await {
                        warn!("Queue not drained within {} seconds", timeout.as_secs());
                    }
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {e}");
                    failed = true;
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
                break;
            }
        }
    }

    service.shutdown().await;
    info!("Shutdown complete");
    if failed {
        process::exit(1);
    }
}
