use crossterm::cursor::MoveUp;
use crossterm::terminal::{Clear, ClearType};
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::LogParams;
use std::collections::VecDeque;
use std::io::{IsTerminal, Write};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// The in-place panel keeps the last N lines of remote output.
const MAX_DISPLAY_LINES: usize = 25;
/// Panel refresh throttle; a few redraws per second is plenty.
const REFRESH_INTERVAL: Duration = Duration::from_millis(250);

/// Start streaming a pod's logs in a detached background task. The task
/// never fails the caller: stream end, protocol errors and API errors all
/// terminate it silently; anything unexpected is logged at warning with the
/// pod name.
pub fn start(client: kube::Client, pod_name: String, namespace: String) -> JoinHandle<()> {
    info!("Streaming logs from {}...", pod_name);

    crate::runtime::spawn(async move {
        if let Err(e) = stream_pod_logs(client, &pod_name, &namespace).await {
            warn!("Log streaming from {} failed unexpectedly: {}", pod_name, e);
        }
    })
}

async fn stream_pod_logs(client: kube::Client, pod_name: &str, namespace: &str) -> Result<(), String> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let log_params = LogParams {
        follow: true,
        ..Default::default()
    };

    // Pod deleted or not found: nothing to stream.
    let reader = match api.log_stream(pod_name, &log_params).await {
        Ok(reader) => reader,
        Err(_) => return Ok(()),
    };
    let lines = reader.lines();

    if std::io::stdout().is_terminal() {
        render_live_panel(lines, pod_name).await
    } else {
        render_plain(lines, pod_name).await
    }
}

/// Bounded in-place panel: the previous frame is erased and redrawn with the
/// most recent lines, a few times per second at most.
async fn render_live_panel(
    mut lines: impl futures::Stream<Item = std::io::Result<String>> + Unpin,
    pod_name: &str,
) -> Result<(), String> {
    let mut recent: VecDeque<String> = VecDeque::with_capacity(MAX_DISPLAY_LINES);
    let mut drawn_height: u16 = 0;
    let mut last_refresh = Instant::now() - REFRESH_INTERVAL;

    loop {
        match lines.next().await {
            Some(Ok(line)) => {
                if recent.len() == MAX_DISPLAY_LINES {
                    recent.pop_front();
                }
                recent.push_back(line);

                if last_refresh.elapsed() >= REFRESH_INTERVAL {
                    drawn_height = draw_panel(&recent, pod_name, drawn_height).map_err(|e| e.to_string())?;
                    last_refresh = Instant::now();
                }
            }
            // Connection broken mid-stream (pod terminated): end silently.
            Some(Err(_)) => break,
            // EOF: container exited.
            None => break,
        }
    }

    draw_panel(&recent, pod_name, drawn_height).map_err(|e| e.to_string())?;
    Ok(())
}

fn draw_panel(recent: &VecDeque<String>, pod_name: &str, previous_height: u16) -> std::io::Result<u16> {
    let mut stdout = std::io::stdout().lock();

    if previous_height > 0 {
        crossterm::queue!(stdout, MoveUp(previous_height), Clear(ClearType::FromCursorDown))?;
    }

    writeln!(stdout, "── Remote logs ({pod_name}) ──")?;
    if recent.is_empty() {
        writeln!(stdout, "Waiting for output...")?;
    }
    for line in recent {
        writeln!(stdout, "{line}")?;
    }
    stdout.flush()?;

    Ok((1 + recent.len().max(1)) as u16)
}

/// Non-interactive output: raw lines bracketed by rule markers.
async fn render_plain(
    mut lines: impl futures::Stream<Item = std::io::Result<String>> + Unpin,
    pod_name: &str,
) -> Result<(), String> {
    println!("──── Remote logs ({pod_name}) ────");

    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => println!("{line}"),
            Err(_) => break,
        }
    }

    println!("──── End remote logs ────");
    Ok(())
}
