//! What ends the process: an OS signal or a fatal pool fault.

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tracing::{error, info};

use crate::database::PoolFault;

#[derive(Debug, Clone)]
pub enum Trigger {
    /// SIGINT or SIGTERM; exit cleanly once drained.
    Signal(&'static str),
    /// The pool reported a fault the process should not survive.
    Fault(PoolFault),
}

impl Trigger {
    pub fn is_fault(&self) -> bool {
        matches!(self, Trigger::Fault(_))
    }
}

/// Watch for signals and pool faults from now on, in the background.
///
/// The receiver turns `Some` once; every clone observes it. Start this before
/// any slow startup step so a signal during startup is not missed.
pub fn spawn_trigger_watch(faults: Option<UnboundedReceiver<PoolFault>>) -> watch::Receiver<Option<Trigger>> {
    let (tx, rx) = watch::channel(None);
    tokio::spawn(async move {
        let trigger = wait_for_trigger(faults).await;
        let _ = tx.send(Some(trigger));
    });
    rx
}

/// Resolve once the watch has fired. Stays pending if it never will.
pub async fn triggered(mut triggers: watch::Receiver<Option<Trigger>>) -> Trigger {
    let fired = match triggers.wait_for(Option::is_some).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    };
    match fired {
        Some(trigger) => trigger,
        None => std::future::pending().await,
    }
}

/// Resolve on the first signal or pool fault.
pub async fn wait_for_trigger(faults: Option<UnboundedReceiver<PoolFault>>) -> Trigger {
    tokio::select! {
        name = signal() => {
            info!(signal = name, "received shutdown signal");
            Trigger::Signal(name)
        }
        fault = next_fault(faults) => {
            error!(error = %fault, "database pool fault, shutting down");
            Trigger::Fault(fault)
        }
    }
}

async fn next_fault(faults: Option<UnboundedReceiver<PoolFault>>) -> PoolFault {
    if let Some(mut faults) = faults {
        if let Some(fault) = faults.recv().await {
            return fault;
        }
    }
    std::future::pending().await
}

async fn signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
