//! Per-worker fuzzing loop.
//!
//! One worker owns one VM, one seed corpus and one coverage state. The
//! outer loop selects a seed and its energy; the inner loop runs one test
//! per iteration: restore snapshot, mutate, trace, execute, drain consoles,
//! classify coverage. Transport timeouts and console panic signatures mark
//! a test as a crash and force a full VM restart.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use coverage::{Coverage, CoverageManager, RegionIndex};
use fuzzer_data::{Config, FuzzInput};
use log::{error, info, warn};
use rand::SeedableRng;
use rand_isaac::Isaac64Rng;
use uuid::Uuid;

use crate::corpus::SeedCorpus;
use crate::crash::CrashStore;
use crate::mutator::MutateError;
use crate::power_scheduler::{EnergyPolicy, PowerScheduler};
use crate::qemu::QemuController;
use crate::serial::SerialTap;
use crate::ssh::{SshClient, SshError};
use crate::targets::{create_target, FuzzerTarget, RunError, TestContext};
use crate::ConfigError;

/// Console contents that classify a test as a crash.
const PANIC_SIGNATURES: [&str; 3] = ["sbi_trap_error", "TA panicked with code", "Kernel panic"];

#[derive(Debug)]
pub enum WorkerError {
    Config(ConfigError),
    /// The emulator could not be launched.
    SpawnFailed,
    /// Guest harness preparation failed.
    SetupFailed,
    /// The initial snapshot could not be saved.
    SnapshotFailed,
    Transport(SshError),
    Mutate(MutateError),
    Io(std::io::Error),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Config(e) => write!(f, "{e}"),
            WorkerError::SpawnFailed => write!(f, "failed to launch machine"),
            WorkerError::SetupFailed => write!(f, "failed to set up the guest harness"),
            WorkerError::SnapshotFailed => write!(f, "failed to save the VM snapshot"),
            WorkerError::Transport(e) => write!(f, "{e}"),
            WorkerError::Mutate(e) => write!(f, "{e}"),
            WorkerError::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<ConfigError> for WorkerError {
    fn from(error: ConfigError) -> Self {
        WorkerError::Config(error)
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(error: std::io::Error) -> Self {
        WorkerError::Io(error)
    }
}

/// What the restart logic needs to know about a finished test.
struct TestOutcome {
    need_restart: bool,
}

pub struct Worker {
    config: Arc<Config>,
    task_id: String,
    crash_store: CrashStore,
    shutdown: Arc<AtomicBool>,
    ssh: SshClient,
    controller: QemuController,
    target: Box<dyn FuzzerTarget>,
    corpus: SeedCorpus,
    coverage: Coverage,
    manager: CoverageManager,
    scheduler: PowerScheduler,
    rng: Isaac64Rng,
    vm_params: Vec<String>,
    local_work_dir: PathBuf,
    snapshot_created: bool,
    total_tested_count: u64,
    total_elapsed_us: u64,
}

impl Worker {
    pub fn new(
        config: Arc<Config>,
        task_num: usize,
        crash_store: CrashStore,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, ConfigError> {
        let task_id = format!("task-{task_num}");
        let ssh_port = config.qemu_params.port + task_num as u16;
        let gdb_port = config.fuzzing.gdb_port + task_num as u16;

        let ssh = SshClient::new(&config, ssh_port);
        let target = create_target(&config, &task_id, ssh.clone())?;
        let vm_params = target.extra_vm_params();

        let kernel_index = RegionIndex::from_entries(&config.address_filters.kernel)
            .map_err(|source| ConfigError::BadAddressFilter {
                which: "kernel",
                source,
            })?;
        let firmware_index = RegionIndex::from_entries(&config.address_filters.firmware)
            .map_err(|source| ConfigError::BadAddressFilter {
                which: "firmware",
                source,
            })?;
        let coverage = Coverage::new(
            kernel_index,
            firmware_index,
            config.fuzzing.ignore_kernel_coverage,
            config.fuzzing.ignore_firmware_coverage,
        );

        let corpus = SeedCorpus::load(&config.fuzzing.seed_dir, &task_id)?;
        let policy: EnergyPolicy = config.fuzzing.assign_energy_function.parse()?;
        let scheduler = PowerScheduler::new(policy, config.fuzzing.default_energy);
        let controller = QemuController::new(Arc::clone(&config), &task_id, ssh_port, gdb_port);

        let rng_seed: u64 = rand::random();
        info!("{task_id}: starting with RNG seed {rng_seed}");

        Ok(Worker {
            local_work_dir: PathBuf::from(&config.fuzzing.local_work_dir),
            task_id,
            crash_store,
            shutdown,
            ssh,
            controller,
            target,
            corpus,
            coverage,
            manager: CoverageManager::new(),
            scheduler,
            rng: Isaac64Rng::seed_from_u64(rng_seed),
            vm_params,
            snapshot_created: false,
            total_tested_count: 0,
            total_elapsed_us: 0,
            config,
        })
    }

    pub async fn run(mut self) -> Result<(), WorkerError> {
        fs::create_dir_all(&self.local_work_dir)?;
        fs::create_dir_all(self.machine_info_dir_local())?;

        let rootfs = self.target.copy_files()?;
        self.controller.set_rootfs_file(rootfs);
        self.controller.set_working_dir(self.target.working_dir());

        if !self.controller.start(&self.vm_params).await {
            error!("{}: failed to launch machine", self.task_id);
            return Err(WorkerError::SpawnFailed);
        }
        self.controller
            .wait_ready(self.config.fuzzing.wait_for_qemu_seconds)
            .await;
        self.capture_boot_console().await;

        if !self.initial_setup(true).await {
            self.controller.stop().await;
            return Err(WorkerError::SetupFailed);
        }
        self.target.extra_setup(&mut self.coverage);

        let result = self.fuzzing_loop().await;

        info!("{}: fuzzing done, cleaning up...", self.task_id);
        if self.controller.is_alive() {
            self.controller.delete_snapshot().await;
        }
        self.controller.stop().await;
        result
    }

    async fn fuzzing_loop(&mut self) -> Result<(), WorkerError> {
        let max_fuzzing_loop = self.config.fuzzing.max_fuzzing_loop;
        let mut loop_cnt: u64 = 0;
        let mut fuzzing_done = false;

        while !fuzzing_done {
            if loop_cnt > max_fuzzing_loop || self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let Some(seed_id) = self.corpus.pick_random(&mut self.rng) else {
                break;
            };
            let Some(seed) = self.corpus.get(&seed_id) else {
                break;
            };
            let energy =
                self.scheduler
                    .assign_energy(seed, self.total_tested_count, self.total_elapsed_us);
            let iterations = iterations_for(energy);
            info!("loop {loop_cnt}, seed: {seed_id}, energy: {energy:.2} ({iterations} runs)");

            for _ in 0..iterations {
                if self.shutdown.load(Ordering::Relaxed) {
                    fuzzing_done = true;
                    break;
                }

                match self.run_one_test(&seed_id).await {
                    Ok(outcome) => {
                        if outcome.need_restart || !self.controller.is_alive() {
                            if !self.restart_vm().await {
                                error!("{}: failed to restart machine", self.task_id);
                                fuzzing_done = true;
                                break;
                            }
                        } else if !self.controller.load_snapshot().await {
                            warn!("restoring machine state failed, restarting the VM");
                            if !self.restart_vm().await {
                                fuzzing_done = true;
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        error!("{}: an error occurred: {e}", self.task_id);
                        return Err(e);
                    }
                }
            }

            loop_cnt += 1;
        }
        Ok(())
    }

    async fn run_one_test(&mut self, seed_id: &str) -> Result<TestOutcome, WorkerError> {
        let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        let test_dir_name = format!("{}-{}-{}", self.task_id, timestamp, Uuid::new_v4());
        let local_test_dir = self.local_work_dir.join(&test_dir_name);
        let remote_test_dir = format!(
            "{}/{}",
            self.config.fuzzing.remote_work_dir, test_dir_name
        );
        info!("test: {test_dir_name}");

        self.ssh
            .exec(&format!("mkdir -p {remote_test_dir}"))
            .await
            .map_err(WorkerError::Transport)?;
        fs::create_dir_all(&local_test_dir)?;

        if !self.snapshot_created {
            self.ssh
                .exec("sync")
                .await
                .map_err(WorkerError::Transport)?;
            if !self.controller.save_snapshot().await {
                error!("failed to save state");
                return Err(WorkerError::SnapshotFailed);
            }
            self.snapshot_created = true;
        }

        let Some(parent_seed) = self.corpus.get(seed_id).map(|record| record.seed.clone())
        else {
            return Ok(TestOutcome { need_restart: false });
        };
        let fuzz_params = self
            .target
            .generate_input(&mut self.rng, &parent_seed)
            .map_err(WorkerError::Mutate)?;

        let console0_log = local_test_dir.join("console0.log");
        let mut tap0 = Some(
            SerialTap::open(self.controller.serial_socket_path0(), &console0_log).await?,
        );
        let (mut tap1, console1_log) = match self.controller.serial_socket_path1() {
            Some(socket) => {
                let log = local_test_dir.join("console1.log");
                (Some(SerialTap::open(socket, &log).await?), Some(log))
            }
            None => (None, None),
        };

        let trace_log = local_test_dir.join("qemu_trace_log.log");
        self.controller.trace_on(&trace_log).await;

        let ctx = TestContext {
            remote_test_dir: remote_test_dir.clone(),
            local_test_dir: local_test_dir.clone(),
        };
        let mut maybe_crashed = false;
        let mut need_restart = false;
        let exec_result = match self.target.run_test(&fuzz_params, &ctx).await {
            Ok(result) => Some(result),
            Err(RunError::Ssh(e)) => {
                info!("maybe got a crash: {e}");
                maybe_crashed = true;
                need_restart = true;
                None
            }
            Err(RunError::Io(e)) => return Err(WorkerError::Io(e)),
        };

        if !maybe_crashed {
            // On a suspected crash the trace stays on; the VM is killed.
            self.controller.trace_off().await;
        }

        if let Some(tap) = tap0.as_mut() {
            let _ = tap.drain().await;
        }
        if let Some(tap) = tap1.as_mut() {
            let _ = tap.drain().await;
        }
        if let Some(tap) = tap0.take() {
            let _ = tap.close().await;
        }
        if let Some(tap) = tap1.take() {
            let _ = tap.close().await;
        }

        self.total_tested_count += 1;
        let mut elapsed_us = 0;
        if let Some(result) = &exec_result {
            elapsed_us = result.elapsed_us;
            self.total_elapsed_us += elapsed_us;
            save_cmd_output(&result.stdout, &local_test_dir.join("stdout.txt"))?;
            save_cmd_output(&result.stderr, &local_test_dir.join("stderr.txt"))?;
        }

        let crashed = maybe_crashed
            || is_crashed(&console0_log)
            || console1_log.as_deref().is_some_and(is_crashed);
        // A console panic forces the same hard restart a transport
        // timeout does, even with the emulator process still alive.
        need_restart = need_restart || crashed;

        if crashed {
            info!("[+] found crash! test dir: {}", local_test_dir.display());
            self.crash_store.add(fuzz_params.clone()).await;
            if let Err(e) = CrashStore::persist(&local_test_dir, &fuzz_params) {
                error!("persisting crash input failed: {e}");
            }
        } else {
            let dmesg = self
                .ssh
                .exec("dmesg -c")
                .await
                .map_err(WorkerError::Transport)?;
            save_cmd_output(&dmesg.stdout, &local_test_dir.join("dmesg.log"))?;

            self.ssh
                .copy_back(&remote_test_dir, &self.local_work_dir)
                .await
                .map_err(WorkerError::Transport)?;

            match read_trace(&trace_log) {
                Ok(pcs) => self.process_coverage(seed_id, &pcs, elapsed_us, &fuzz_params),
                Err(e) => warn!("trace log {} not readable: {e}", trace_log.display()),
            }
        }

        Ok(TestOutcome { need_restart })
    }

    fn process_coverage(
        &mut self,
        seed_id: &str,
        pcs: &[String],
        elapsed_us: u64,
        fuzz_params: &FuzzInput,
    ) {
        let result = match self.coverage.analyze(pcs) {
            Ok(result) => result,
            Err(e) => {
                warn!("skipping coverage update: {e}");
                return;
            }
        };

        if result.new_kernel || result.new_firmware {
            let parent_seed = match self.corpus.get(seed_id) {
                Some(record) => record.seed.clone(),
                None => return,
            };
            let new_seed = self.target.create_new_seed(&parent_seed, fuzz_params);
            let (kernel, firmware) = self.coverage.maps();
            self.corpus.add(seed_id, new_seed, elapsed_us, kernel, firmware);
        } else {
            self.corpus.update(seed_id, elapsed_us);
        }

        let (kernel, firmware) = self.coverage.maps();
        self.manager.merge(kernel, firmware);

        self.manager.record_hash(seed_id, Some(&result.fingerprint));
        let others = self.manager.count_others(Some(&result.fingerprint), seed_id);
        self.corpus.update_hash(seed_id, &result.fingerprint, others);

        info!(
            "kernel coverage: {}, firmware coverage: {}",
            result.new_kernel, result.new_firmware
        );
    }

    /// Hard VM restart after a crash or a vanished emulator: kill, relaunch,
    /// re-prepare the harness. The snapshot must be re-created afterwards.
    async fn restart_vm(&mut self) -> bool {
        self.controller.stop().await;

        info!("restarting machine...");
        if !self.controller.start(&self.vm_params).await {
            return false;
        }
        self.controller
            .wait_ready(self.config.fuzzing.wait_for_qemu_seconds)
            .await;

        if !self.initial_setup(false).await {
            return false;
        }
        self.snapshot_created = false;
        info!("restarted machine with PID: {:?}", self.controller.pid());
        true
    }

    /// Prepares the guest; on the first boot also records machine info
    /// (boot dmesg) and disables guest ASLR.
    async fn initial_setup(&mut self, first_run: bool) -> bool {
        match self.target.prepare_harness().await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                error!("error during initial setup: {e}");
                return false;
            }
        }

        if first_run {
            if let Err(e) = self.record_machine_info().await {
                error!("error during initial setup: {e}");
                return false;
            }
        }

        info!("process with PID {:?} is running", self.controller.pid());
        true
    }

    async fn record_machine_info(&mut self) -> Result<(), WorkerError> {
        let machine_info_dir = self.machine_info_dir_name();
        self.ssh
            .exec(&format!(
                "mkdir -p {}/{machine_info_dir}",
                self.config.fuzzing.remote_work_dir
            ))
            .await
            .map_err(WorkerError::Transport)?;

        let local_dir = self.machine_info_dir_local();
        fs::create_dir_all(&local_dir)?;

        let dmesg = self
            .ssh
            .exec("dmesg -c")
            .await
            .map_err(WorkerError::Transport)?;
        save_cmd_output(&dmesg.stdout, &local_dir.join("boot-dmesg.log"))?;

        let aslr = self
            .ssh
            .exec("sysctl -w kernel.randomize_va_space=0")
            .await
            .map_err(WorkerError::Transport)?;
        save_cmd_output(&aslr.stdout, &local_dir.join("disable_aslr.log"))?;
        Ok(())
    }

    /// Drains both serial consoles right after boot so targets can parse
    /// the boot log (e.g. for dynamically loaded code regions).
    async fn capture_boot_console(&mut self) {
        let sockets: Vec<(PathBuf, PathBuf)> = {
            let mut sockets = vec![(
                self.controller.serial_socket_path0().to_path_buf(),
                self.local_work_dir
                    .join(format!("{}-console0.log", self.task_id)),
            )];
            if let Some(socket) = self.controller.serial_socket_path1() {
                sockets.push((
                    socket.to_path_buf(),
                    self.local_work_dir
                        .join(format!("{}-console1.log", self.task_id)),
                ));
            }
            sockets
        };

        for (socket, log) in sockets {
            match SerialTap::open(&socket, &log).await {
                Ok(mut tap) => {
                    let _ = tap.drain().await;
                    let _ = tap.close().await;
                }
                Err(e) => warn!("boot console tap {} failed: {e}", socket.display()),
            }
        }
    }

    fn machine_info_dir_name(&self) -> String {
        format!("{}-{}", self.task_id, self.config.fuzzing.machine_info_dir)
    }

    fn machine_info_dir_local(&self) -> PathBuf {
        self.local_work_dir.join(self.machine_info_dir_name())
    }
}

/// Integer upper bound of the inner loop for an energy value in `(0, M]`.
fn iterations_for(energy: f64) -> u64 {
    energy.ceil().max(1.0) as u64
}

/// One PC per line; blank lines are skipped, everything else is left to
/// the analyzer.
fn read_trace(path: &Path) -> std::io::Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}

/// Whether a drained console log carries one of the panic signatures.
fn is_crashed(console_log: &Path) -> bool {
    match fs::read(console_log) {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            PANIC_SIGNATURES.iter().any(|needle| text.contains(needle))
        }
        Err(e) => {
            warn!("console log {} not readable: {e}", console_log.display());
            false
        }
    }
}

fn save_cmd_output(buffer: &str, path: &Path) -> std::io::Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    fs::write(path, buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_rounds_up_to_whole_iterations() {
        assert_eq!(iterations_for(2.0), 2);
        assert_eq!(iterations_for(3.7), 4);
        assert_eq!(iterations_for(0.02), 1);
        assert_eq!(iterations_for(100.0), 100);
    }

    #[test]
    fn panic_signatures_mark_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        for signature in PANIC_SIGNATURES {
            let log = dir.path().join("console0.log");
            fs::write(&log, format!("boot ok\n{signature}: at 0xdead\n")).unwrap();
            assert!(is_crashed(&log), "{signature} not detected");
        }

        let clean = dir.path().join("clean.log");
        fs::write(&clean, "OpenSBI v1.4\ntest finished rc=0\n").unwrap();
        assert!(!is_crashed(&clean));
    }

    #[test]
    fn missing_console_log_is_not_a_crash() {
        assert!(!is_crashed(Path::new("/nonexistent/console0.log")));
    }

    #[test]
    fn trace_reader_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let trace = dir.path().join("qemu_trace_log.log");
        fs::write(&trace, "0x80200000\n\n0x80200004\n   \n0x2000\n").unwrap();
        let pcs = read_trace(&trace).unwrap();
        assert_eq!(pcs, ["0x80200000", "0x80200004", "0x2000"]);
    }

    #[test]
    fn empty_command_output_writes_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout.txt");
        save_cmd_output("", &path).unwrap();
        assert!(!path.exists());
        save_cmd_output("data", &path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "data");
    }
}
