use rv_engine::Slurm;
use rv_engine::allocator::LiveJobs;
use rv_engine::slurm::SchedulerApi as _;

/// Two-stage Ctrl-C handling around a fan-out.
///
/// The first interrupt cancels every submission still live so the fan-out is
/// not leaked into the queue; a second interrupt skips the cleanup and exits
/// immediately. Either way the process exits 130.
pub fn spawn_ctrl_c_handler(slurm: Slurm, live: LiveJobs) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }

        let ids = live.ids();
        if ids.is_empty() {
            std::process::exit(130);
        }

        eprintln!(
            "Interrupted — cancelling {} live submission(s) (press CTRL+C again to exit immediately).",
            ids.len()
        );
        tokio::select! {
            res = slurm.cancel_many(&ids) => {
                if let Err(err) = res {
                    eprintln!("warning: failed to cancel submissions: {err}");
                }
            }
            _ = async {
                let _ = tokio::signal::ctrl_c().await;
            } => {
                eprintln!("Exiting immediately; submissions may still be queued.");
            }
        }
        std::process::exit(130);
    });
}
