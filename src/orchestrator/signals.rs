//! Termination signal listener

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::OrchestratorHandle;

/// Human readable name of a termination signal
pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGINT => "SIGINT",
        libc::SIGTERM => "SIGTERM",
        libc::SIGHUP => "SIGHUP",
        _ => "signal",
    }
}

/// Forward SIGINT, SIGTERM and SIGHUP to the orchestrator until it is gone
pub fn listen_for_signals(handle: OrchestratorHandle) -> std::io::Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(()) = interrupt.recv() => libc::SIGINT,
                Some(()) = terminate.recv() => libc::SIGTERM,
                Some(()) = hangup.recv() => libc::SIGHUP,
                else => break,
            };

            info!("Received {}", signal_name(received));
            if !handle.signal(received) {
                debug!("Orchestrator gone, no longer listening for signals");
                break;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(libc::SIGINT, "SIGINT")]
    #[test_case(libc::SIGTERM, "SIGTERM")]
    #[test_case(libc::SIGHUP, "SIGHUP")]
    #[test_case(libc::SIGUSR1, "signal")]
    fn test_signal_name(signal: i32, name: &str) {
        assert_eq!(signal_name(signal), name);
    }
}
