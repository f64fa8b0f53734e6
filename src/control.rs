use anyhow::{Context, Result};
use futures::StreamExt;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{getpgid, Pid};
use signal_hook::consts::signal::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook_tokio::Signals;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::runtime::Supervisor;

/// How long the trap leaves the owner of the done signal to shut down before exiting itself.
const EXIT_GRACE: Duration = Duration::from_secs(5);


/*
    @@@
    @resolve_process_group();
    . Looks up the process group of a child by pid.
    . Fails with ESRCH once the child has been reaped, which callers treat as "already gone".
*/
pub fn resolve_process_group(pid: u32) -> nix::Result<Pid> {
    let raw = i32::try_from(pid).map_err(|_| nix::Error::EINVAL)?;
    if raw <= 0 {
        // getpgid(0) would resolve our own group
        return Err(nix::Error::EINVAL);
    }
    getpgid(Some(Pid::from_raw(raw)))
}



/*
    @@@
    @signal_group();
    . Delivers a signal to every member of the group (negative-pid semantics), so grandchildren are reclaimed too.
*/
pub fn signal_group(pgid: Pid, sig: Signal) -> nix::Result<()> {
    match killpg(pgid, sig) {
        Ok(()) => {
            info!(pgid = pgid.as_raw(), signal = ?sig, "signalled process group");
            Ok(())
        }
        Err(e) => {
            error!(pgid = pgid.as_raw(), signal = ?sig, error = %e, "failed to signal process group");
            Err(e)
        }
    }
}



/*
    @@@
    @trap_host_signals();
    . Registers SIGINT, SIGTERM and SIGQUIT for the supervisor process itself.
    . On the first one received, marks the supervisor interrupted and stops every child process group.
    . Stopping settles all slots, so whoever awaits the done signal can flush logs and exit with status 1.
    . Exits the host process itself only if that has not happened within EXIT_GRACE.
*/
pub fn trap_host_signals(supervisor: Supervisor) -> Result<JoinHandle<()>> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT])
        .context("registering host signal trap")?;
    let handle = signals.handle();

    Ok(tokio::spawn(async move {
        if let Some(sig) = signals.next().await {
            warn!(signal = sig, "received host signal; stopping all processes");
            supervisor.mark_interrupted();
            supervisor.stop_all().await;
            info!("killed all");
            handle.close();

            tokio::time::sleep(EXIT_GRACE).await;
            error!("done signal not handled after host signal; exiting");
            std::process::exit(1);
        }
    }))
}
