//! Top-level agent supervision: dial → session → reconnect with backoff,
//! the bundled SSH forwarder child, and graceful signal handling.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::SharedConf;
use crate::error::AgentError;
use crate::rules::{parse_rules, ResourceRule};
use crate::session::Session;
use crate::transport;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Runs the agent until graceful shutdown or a failure the supervisor will
/// not retry. Recoverable session failures reconnect with exponential
/// backoff; the budget of consecutive failures comes from the config and
/// resets every time a session reaches the ready state.
pub async fn run(conf: SharedConf) -> Result<(), AgentError> {
    let raw_rules = std::fs::read(&conf.rules_file).map_err(|e| {
        AgentError::Config(format!(
            "cannot read rules file {}: {e}",
            conf.rules_file.display()
        ))
    })?;
    let rules = parse_rules(&raw_rules)?;
    info!(
        resources = rules.len(),
        server = %conf.tunnel_server,
        "agent starting"
    );

    let mut shutdown: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(shutdown_signal());
    let mut consecutive_failures: u32 = 0;
    let mut backoff = BACKOFF_BASE;

    loop {
        let outcome = run_session_once(
            &conf,
            &rules,
            &raw_rules,
            &mut shutdown,
            &mut consecutive_failures,
            &mut backoff,
        )
        .await;

        match outcome {
            Ok(()) => {
                info!("agent shut down");
                return Ok(());
            }
            Err(e) if !e.is_recoverable() => {
                error!(kind = e.kind(), cause = %error_chain(&e), "giving up on terminal failure");
                return Err(e);
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    kind = e.kind(),
                    cause = %error_chain(&e),
                    attempt = consecutive_failures,
                    budget = conf.reconnect_budget(),
                    "session failed"
                );
                if consecutive_failures >= conf.reconnect_budget() {
                    error!(kind = e.kind(), "reconnect budget exhausted");
                    return Err(e);
                }
                tokio::select! {
                    _ = sleep(backoff) => {}
                    _ = shutdown.as_mut() => {
                        info!("agent shut down during backoff");
                        return Ok(());
                    }
                }
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
    }
}

async fn run_session_once(
    conf: &SharedConf,
    rules: &[ResourceRule],
    raw_rules: &[u8],
    shutdown: &mut Pin<Box<dyn Future<Output = ()> + Send>>,
    consecutive_failures: &mut u32,
    backoff: &mut Duration,
) -> Result<(), AgentError> {
    let stream = tokio::select! {
        dialed = transport::dial(conf) => dialed?,
        _ = shutdown.as_mut() => return Ok(()),
    };

    let mut session = tokio::select! {
        established = Session::establish(stream, conf.clone(), rules, raw_rules) => established?,
        _ = shutdown.as_mut() => return Ok(()),
    };

    // Reaching the ready state pays the failure budget back.
    *consecutive_failures = 0;
    *backoff = BACKOFF_BASE;

    let mut forwarder = spawn_forwarder(conf, session.socks_addr().port())?;

    let result = tokio::select! {
        err = session.run_until_failure() => Err(err),
        _ = shutdown.as_mut() => Ok(()),
    };

    session.shutdown();
    if let Err(err) = &result {
        error!(
            session = %session.id(),
            kind = err.kind(),
            cause = %error_chain(err),
            "session ended"
        );
    }
    if let Some(child) = forwarder.as_mut() {
        if let Err(e) = child.kill().await {
            warn!(error = %e, "could not kill ssh forwarder");
        }
    }
    result
}

/// Launches the bundled SSH port-forwarder, passing the live SOCKS port as
/// the final argv entry. The child is killed when the session ends and
/// also dies with the agent process.
fn spawn_forwarder(conf: &SharedConf, socks_port: u16) -> Result<Option<Child>, AgentError> {
    let Some(argv) = conf.ssh_forwarder.as_ref() else {
        return Ok(None);
    };
    let Some((program, args)) = argv.split_first() else {
        return Err(AgentError::Config("ssh_forwarder must name a command".into()));
    };
    let child = Command::new(program)
        .args(args)
        .arg(socks_port.to_string())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AgentError::Config(format!("cannot launch ssh forwarder {program:?}: {e}")))?;
    info!(command = %program, socks_port, "ssh forwarder launched");
    Ok(Some(child))
}

/// Resolves when the process receives `SIGINT` or `SIGTERM`.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

/// Formats the error with its full cause chain for the one structured
/// failure line logged per session.
pub fn error_chain(err: &AgentError) -> String {
    let mut out = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
