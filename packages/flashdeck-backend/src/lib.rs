/// Flashdeck backend: terminal study shell over a remote spreadsheet.
///
/// Startup: logger, config, HTTP remote, preload of every catalog sheet,
/// then the start sheet is opened and the shell reads commands from stdin.
pub mod config;
pub mod log_bridge;
pub mod remote;
pub mod shell;

use flashdeck_core::remote::SheetRemote;
use flashdeck_core::sync::{SyncController, SyncEvent};
use flashdeck_core::types::SheetKey;
use std::future::Future;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::remote::HttpSheetRemote;
use crate::shell::Shell;

pub fn run() {
    if let Err(e) = log_bridge::init() {
        log_bridge::write_fallback_line(&format!("failed to initialize backend logger: {}", e));
    }

    let config_path = config::default_config_path();
    let config = config::load_config(&config_path);
    log::info!("[flashdeck.startup] Config from {}", config_path.display());

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("[flashdeck.startup] Failed to start runtime: {}", e);
            eprintln!("flashdeck: failed to start runtime: {}", e);
            return;
        }
    };

    if config.endpoint.trim().is_empty() {
        log::error!("[flashdeck.startup] No endpoint configured");
        eprintln!(
            "flashdeck: no sheet endpoint configured. Set \"endpoint\" in {}",
            config_path.display()
        );
        return;
    }

    runtime.block_on(serve(config));
}

fn print_lines(lines: &[String]) {
    let mut out = std::io::stdout().lock();
    for line in lines {
        let _ = writeln!(out, "{}", line);
    }
    let _ = out.flush();
}

/// Network calls shorter than this show no loading line.
const LOADING_LINE_AFTER: Duration = Duration::from_millis(150);

/// Drive `work` to completion, printing a loading line while the controller
/// is still on the network after a short delay.
async fn with_progress<R: SheetRemote, T>(
    controller: &SyncController<R>,
    events: &mut broadcast::Receiver<SyncEvent>,
    work: impl Future<Output = T>,
) -> T {
    tokio::pin!(work);
    let delay = tokio::time::sleep(LOADING_LINE_AFTER);
    tokio::pin!(delay);
    let mut status: Option<String> = None;
    let mut shown = false;

    loop {
        tokio::select! {
            out = &mut work => {
                while events.try_recv().is_ok() {}
                return out;
            }
            event = events.recv() => {
                let line = match event {
                    Ok(SyncEvent::FetchStarted { key }) => format!("Loading sheet {}...", key),
                    Ok(SyncEvent::SaveStarted { key }) => format!("Saving sheet {}...", key),
                    _ => continue,
                };
                if shown {
                    print_lines(&[line.clone()]);
                }
                status = Some(line);
            }
            _ = &mut delay, if !shown => {
                shown = true;
                if controller.is_busy() {
                    print_lines(&[status.clone().unwrap_or_else(|| "Loading...".to_string())]);
                }
            }
        }
    }
}

async fn serve(config: AppConfig) {
    let remote = match HttpSheetRemote::new(
        &config.endpoint,
        Duration::from_secs(config.request_timeout_secs),
    ) {
        Ok(remote) => remote,
        Err(e) => {
            log::error!("[flashdeck.startup] {}", e);
            eprintln!("flashdeck: {}", e);
            return;
        }
    };
    log::info!("[flashdeck.startup] Remote endpoint {}", remote.endpoint());

    let controller = SyncController::new(remote, config.sheets.clone(), config.sync_settings());
    let mut events = controller.subscribe();

    print_lines(&["Loading sheets...".to_string()]);
    let report = with_progress(&controller, &mut events, controller.preload_all()).await;
    print_lines(&[report.notice().to_string()]);

    let start = config
        .start_sheet
        .as_deref()
        .map(SheetKey::from)
        .or_else(|| controller.catalog().first_key().cloned());
    if let Some(key) = start {
        let outcome = with_progress(&controller, &mut events, controller.load_set(&key)).await;
        print_lines(&[outcome.notice().to_string()]);
    }

    let mut shell = Shell::new(&controller, Duration::from_millis(config.flip_delay_ms));
    print_lines(&shell::render_view(&controller.session().view()));
    print_lines(&["Type `help` for commands.".to_string()]);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        {
            let mut out = std::io::stdout().lock();
            let _ = write!(out, "{}", shell.prompt());
            let _ = out.flush();
        }
        match lines.next_line().await {
            Ok(Some(line)) => {
                let reply = with_progress(&controller, &mut events, shell.handle_line(&line)).await;
                print_lines(&reply.lines);
                if reply.quit {
                    break;
                }
            }
            Ok(None) => {
                if controller.session().is_dirty() {
                    log::warn!("[flashdeck.shell] Input closed with unsaved changes");
                }
                break;
            }
            Err(e) => {
                log::error!("[flashdeck.shell] Failed to read input: {}", e);
                break;
            }
        }
    }
    log::info!("[flashdeck.shell] Bye");
}
