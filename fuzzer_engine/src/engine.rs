//! Engine: spawns the worker fleet and handles shutdown.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fuzzer_data::Config;
use log::{error, info, warn};

use crate::crash::CrashStore;
use crate::worker::{Worker, WorkerError};

pub struct Engine {
    config: Arc<Config>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Engine {
            config: Arc::new(config),
        }
    }

    /// Runs `num_fuzzers` concurrent workers until they finish or Ctrl-C.
    /// Exit status is non-zero when a worker never got its VM up.
    pub async fn run(self) -> ExitCode {
        if let Err(e) = std::fs::create_dir_all(&self.config.fuzzing.local_work_dir) {
            error!(
                "cannot create local work directory {}: {e}",
                self.config.fuzzing.local_work_dir
            );
            return ExitCode::FAILURE;
        }
        if let Err(e) = self.config.save_updated() {
            warn!("writing updated-config.json failed: {e}");
        }

        let crash_store = CrashStore::new();
        let shutdown = Arc::new(AtomicBool::new(false));

        let num_fuzzers = self.config.fuzzing.num_fuzzers;
        let mut handles = Vec::with_capacity(num_fuzzers);
        for task_num in 0..num_fuzzers {
            let config = Arc::clone(&self.config);
            let crash_store = crash_store.clone();
            let shutdown = Arc::clone(&shutdown);
            handles.push(tokio::spawn(async move {
                let worker = Worker::new(config, task_num, crash_store, shutdown)
                    .map_err(WorkerError::Config)?;
                worker.run().await
            }));
        }

        let signal_flag = Arc::clone(&shutdown);
        let signal_task = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C detected, finishing fuzzing loops...");
                signal_flag.store(true, Ordering::Relaxed);
            }
        });

        let mut startup_failed = false;
        for (task_num, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(Ok(())) => info!("task-{task_num} finished"),
                Ok(Err(e)) => {
                    error!("task-{task_num} failed: {e}");
                    if matches!(e, WorkerError::SpawnFailed | WorkerError::Config(_)) {
                        startup_failed = true;
                    }
                }
                Err(e) => {
                    // A panicked worker takes only itself down.
                    error!("task-{task_num} panicked: {e}");
                }
            }
        }
        signal_task.abort();

        info!("crashing inputs recorded: {}", crash_store.len().await);
        if startup_failed {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        }
    }
}
