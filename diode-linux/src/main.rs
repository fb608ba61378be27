// Diode edge client: speaks the edge protocol over stdin/stdout.
// Run it behind a TLS tunnel such as `openssl s_client -quiet -connect <server>`.

use std::time::Duration;

use anyhow::Context;
use diode_core::{EdgeCore, Request, Response, SessionEvent};
use diode_linux::{config, connection};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hello flag announcing a device client.
const HELLO_FLAG: u64 = 1000;

const PEAK_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("diode-linux {}", VERSION);
            return Ok(());
        }
    }

    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load();
    info!(
        dispatch_mode = ?cfg.core.dispatch_mode,
        published_ports = ?cfg.core.published_ports,
        fleet = ?cfg.fleet().map(|a| a.to_string()),
        "starting"
    );

    let rt = tokio::runtime::Runtime::new().context("building runtime")?;
    let result = rt.block_on(async {
        let core = EdgeCore::new(cfg.core.clone());
        let connection::Connection {
            client,
            mut sessions,
            mut task,
        } = connection::spawn(tokio::io::stdin(), tokio::io::stdout(), core);

        tokio::spawn(async move {
            if let Err(e) = client.cast(Request::Hello { flag: HELLO_FLAG }).await {
                warn!(error = %e, "hello failed");
                return;
            }
            match client.call_timeout(Request::GetBlockPeak, PEAK_TIMEOUT).await {
                Ok(Response::BlockPeak(peak)) => info!(peak, "connected"),
                Ok(other) => warn!(method = %other.method(), "unexpected reply to getblockpeak"),
                Err(e) => warn!(error = %e, "getblockpeak failed"),
            }
        });

        tokio::spawn(async move {
            while let Some(event) = sessions.recv().await {
                log_session(&event);
            }
        });

        tokio::select! {
            res = shutdown_signal() => res?,
            res = &mut task => {
                res.context("connection task")?.context("connection")?;
                info!("server closed the connection");
            }
        }
        Ok::<(), anyhow::Error>(())
    });
    // A pending stdin read would otherwise hold up runtime drop.
    rt.shutdown_background();
    result
}

fn log_session(event: &SessionEvent) {
    match event {
        SessionEvent::Opened {
            ref_id,
            port,
            origin,
            ..
        } => info!(ref_id, port, ?origin, "tunnel opened"),
        SessionEvent::OpenFailed {
            request_id,
            port,
            reason,
        } => warn!(request_id, port, %reason, "tunnel open failed"),
        SessionEvent::Data { ref_id, data } => info!(ref_id, len = data.len(), "tunnel data"),
        SessionEvent::Closed { ref_id } => info!(ref_id, "tunnel closed"),
        SessionEvent::Goodbye { reason } => warn!(%reason, "server said goodbye"),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
