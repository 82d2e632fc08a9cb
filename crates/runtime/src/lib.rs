//! Runtime bootstrap for the highlights job: tracing, timely workers, metrics,
//! configuration and the job itself.

use anyhow::Result;
use timely::communication::allocator::Generic;
use timely::worker::Worker;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod job;
pub mod metrics;

pub use config::JobConfig;
pub use job::run_job;
pub use metrics::{JobTimer, MetricsRegistry, MetricsSnapshot};

/// Install the fmt subscriber. `RUST_LOG` selects the levels; without it only `info`
/// and above is printed.
pub fn init_tracing() {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter(directives.as_deref()))
        .try_init();
}

fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Start a single-process timely runtime with `workers` threads and run `f` once per
/// worker, returning each worker's result in worker order.
pub fn start_runtime<T, F>(workers: usize, f: F) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(usize, &mut Worker<Generic>) -> T + Send + Sync + 'static,
{
    let workers = workers.max(1);
    info!(%workers, "starting timely runtime");
    let guards = timely::execute(timely::Config::process(workers), move |worker| {
        let index = worker.index();
        f(index, worker)
    })
    .map_err(anyhow::Error::msg)?;

    guards
        .join()
        .into_iter()
        .map(|result| result.map_err(anyhow::Error::msg))
        .collect()
}
