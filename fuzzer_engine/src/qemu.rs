//! Emulator lifecycle and snapshot control.
//!
//! One controller per worker. The emulator process is spawned with a
//! per-task snapshot overlay, UNIX sockets for the control channel and
//! serial consoles, and user-mode networking with a forwarded SSH port.
//! Control operations connect to the channel per call and report success as
//! a bool; the worker decides between restart and continue.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fuzzer_data::Config;
use log::{error, info, warn};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde_json::json;
use tokio::process::{Child, Command};

use crate::qmp::{execute_once, QmpClient, QmpError};

const SNAPSHOT_DEVICE: &str = "snapshot0";
const ROOTFS_DEVICE: &str = "rootfs0";
const SNAPSHOT_TAG: &str = "mtcfuzz-snapshot";
const TRACE_START_COMMAND: &str = "mtcfuzz-trace-start";
const TRACE_STOP_COMMAND: &str = "mtcfuzz-trace-stop";

pub struct QemuController {
    config: Arc<Config>,
    qmp_socket_path: PathBuf,
    serial_socket_path0: PathBuf,
    serial_socket_path1: Option<PathBuf>,
    ssh_local_port: u16,
    gdb_port: u16,
    snapshot_storage: PathBuf,
    snapshot_created_file: PathBuf,
    /// Staged per-task rootfs image, attached when `qemu_params.rootfs` is
    /// configured.
    rootfs_file: Option<PathBuf>,
    /// Working directory for the emulator process, target-provided.
    working_dir: Option<PathBuf>,
    node_name: Option<String>,
    child: Option<Child>,
    started: bool,
}

impl QemuController {
    pub fn new(config: Arc<Config>, task_id: &str, ssh_local_port: u16, gdb_port: u16) -> Self {
        let work_dir = PathBuf::from(&config.fuzzing.local_work_dir);
        let serial_socket_path1 = config
            .qemu_params
            .extra_serial
            .then(|| work_dir.join(format!("qemu_fuzzer_{task_id}_serial1.sock")));

        QemuController {
            qmp_socket_path: work_dir.join(format!("qemu_fuzzer_{task_id}_qmp.sock")),
            serial_socket_path0: work_dir.join(format!("qemu_fuzzer_{task_id}_serial0.sock")),
            serial_socket_path1,
            ssh_local_port,
            gdb_port,
            snapshot_storage: work_dir.join(format!("{task_id}-fuzz-snapshot.qcow2")),
            snapshot_created_file: work_dir.join(format!("{task_id}-snapshot_created.txt")),
            rootfs_file: None,
            working_dir: None,
            node_name: None,
            child: None,
            started: false,
            config,
        }
    }

    pub fn qmp_socket_path(&self) -> &Path {
        &self.qmp_socket_path
    }

    pub fn serial_socket_path0(&self) -> &Path {
        &self.serial_socket_path0
    }

    pub fn serial_socket_path1(&self) -> Option<&Path> {
        self.serial_socket_path1.as_deref()
    }

    pub fn set_rootfs_file(&mut self, path: Option<PathBuf>) {
        self.rootfs_file = path;
    }

    pub fn set_working_dir(&mut self, dir: Option<PathBuf>) {
        self.working_dir = dir;
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.id())
    }

    /// Whether the emulator process is still running.
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            None => false,
            Some(child) => matches!(child.try_wait(), Ok(None)),
        }
    }

    /// Creates the copy-on-write snapshot overlay. `false` when it already
    /// exists or `qemu-img` fails; a leftover overlay means an unclean
    /// previous run.
    pub async fn create_snapshot_storage(&self) -> bool {
        if self.snapshot_storage.exists() {
            info!("snapshot overlay {} exists", self.snapshot_storage.display());
            return false;
        }
        let result = Command::new("qemu-img")
            .args(["create", "-f", "qcow2"])
            .arg(&self.snapshot_storage)
            .arg(&self.config.fuzzing.qemu_snapshot_storage_size)
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                error!(
                    "qemu-img create failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
                false
            }
            Err(e) => {
                error!("failed to run qemu-img: {e}");
                false
            }
        }
    }

    fn build_params(&self, extra_params: &[String]) -> Vec<String> {
        let qemu = &self.config.qemu_params;
        let mut params: Vec<String> = vec![
            "-machine".into(),
            qemu.machine.clone(),
            "-bios".into(),
            qemu.bios.clone(),
            "-kernel".into(),
            qemu.kernel.clone(),
            "-append".into(),
            qemu.append.clone(),
            "-nographic".into(),
            "-drive".into(),
            format!(
                "file={},if=none,format=qcow2,id={}",
                self.snapshot_storage.display(),
                SNAPSHOT_DEVICE
            ),
            "-netdev".into(),
            format!(
                "user,id=net0,host={},hostfwd=tcp::{}-:22",
                qemu.host, self.ssh_local_port
            ),
            "-device".into(),
            "virtio-net-device,netdev=net0".into(),
            "-smp".into(),
            qemu.smp.clone(),
            "-m".into(),
            qemu.memory.clone(),
            "-qmp".into(),
            format!("unix:{},server,nowait", self.qmp_socket_path.display()),
            "-serial".into(),
            format!("unix:{},server,nowait", self.serial_socket_path0.display()),
            "-object".into(),
            "rng-random,filename=/dev/urandom,id=rng0".into(),
            "-device".into(),
            "virtio-rng-device,rng=rng0".into(),
        ];

        if let Some(serial1) = &self.serial_socket_path1 {
            params.push("-serial".into());
            params.push(format!("unix:{},server,nowait", serial1.display()));
        }

        if let Some(initrd) = &qemu.initrd {
            params.push("-initrd".into());
            params.push(initrd.clone());
        }

        params.extend_from_slice(extra_params);

        if qemu.rootfs.is_some() {
            if let Some(rootfs_file) = &self.rootfs_file {
                params.push("-drive".into());
                params.push(format!(
                    "file={},if=none,format=qcow2,id={}",
                    rootfs_file.display(),
                    ROOTFS_DEVICE
                ));
                params.push("-device".into());
                params.push(format!("virtio-blk-device,drive={ROOTFS_DEVICE}"));
            }
        }

        if self.config.fuzzing.use_gdb {
            params.push("-gdb".into());
            params.push(format!("tcp::{}", self.gdb_port));
            params.push("-S".into());
        }

        params
    }

    /// Launches the emulator. Returns `false` when the overlay cannot be
    /// created or the process fails to spawn.
    pub async fn start(&mut self, extra_params: &[String]) -> bool {
        if self.started {
            warn!("machine already started, skipping startup");
            return true;
        }
        if !self.create_snapshot_storage().await {
            warn!("creating snapshot overlay failed");
            return false;
        }

        let params = self.build_params(extra_params);
        info!(
            "launching {} {}",
            self.config.qemu_params.qemu_path,
            params.join(" ")
        );

        let mut command = Command::new(&self.config.qemu_params.qemu_path);
        command.args(&params).kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        if !self.config.debug {
            command
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null());
        }

        match command.spawn() {
            Ok(child) => {
                info!("emulator launched with PID: {:?}", child.id());
                self.child = Some(child);
                self.started = true;
                true
            }
            Err(e) => {
                error!("error launching emulator: {e}");
                false
            }
        }
    }

    /// Waits for the guest to come up. After a restart the snapshot marker
    /// makes this a 100 ms formality.
    pub async fn wait_ready(&self, timeout_secs: f64) {
        let wait = if self.snapshot_created() {
            0.1
        } else {
            timeout_secs
        };
        info!("waiting {wait} seconds for the emulator");
        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
    }

    /// Kills the emulator (SIGKILL) and removes the overlay and marker.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
                Ok(Ok(status)) => info!("emulator exited with: {status}"),
                Ok(Err(e)) => error!("waiting for emulator exit failed: {e}"),
                Err(_) => error!("emulator did not exit within 2s of SIGKILL"),
            }
        }
        self.remove_snapshot_storage();
        self.node_name = None;
        self.started = false;
    }

    /// Pauses the VM, saves a live snapshot (vmstate plus the overlay and,
    /// when attached, the rootfs drive), marks it on disk and resumes.
    pub async fn save_snapshot(&mut self) -> bool {
        match self.save_snapshot_inner().await {
            Ok(()) => {
                info!(
                    "snapshot was created successfully: {}",
                    self.snapshot_created_file.display()
                );
                true
            }
            Err(e) => {
                error!("save_snapshot failed: {e}");
                false
            }
        }
    }

    async fn save_snapshot_inner(&mut self) -> Result<(), QmpError> {
        let mut client = QmpClient::connect(&self.qmp_socket_path).await?;
        let node = self.resolve_node_name(&mut client).await?;

        client.execute("stop", None).await?;

        let mut devices = vec![node.clone()];
        if self.config.qemu_params.rootfs.is_some() && self.rootfs_file.is_some() {
            devices.push(ROOTFS_DEVICE.to_string());
        }

        info!("saving snapshot...");
        client
            .execute(
                "snapshot-save",
                Some(json!({
                    "job-id": snapshot_job_id("save"),
                    "tag": SNAPSHOT_TAG,
                    "vmstate": node,
                    "devices": devices,
                })),
            )
            .await?;

        std::fs::write(&self.snapshot_created_file, "snapshot created")?;
        client.execute("cont", None).await?;
        Ok(())
    }

    /// Pauses the VM, restores the tagged snapshot and resumes.
    pub async fn load_snapshot(&mut self) -> bool {
        match self.load_snapshot_inner().await {
            Ok(()) => true,
            Err(e) => {
                error!("load_snapshot failed: {e}");
                false
            }
        }
    }

    async fn load_snapshot_inner(&mut self) -> Result<(), QmpError> {
        let mut client = QmpClient::connect(&self.qmp_socket_path).await?;
        let node = self.resolve_node_name(&mut client).await?;

        client.execute("stop", None).await?;
        client
            .execute(
                "snapshot-load",
                Some(json!({
                    "job-id": snapshot_job_id("load"),
                    "tag": SNAPSHOT_TAG,
                    "vmstate": node,
                    "devices": [node],
                })),
            )
            .await?;
        client.execute("cont", None).await?;
        Ok(())
    }

    /// Deletes the tagged snapshot and removes the marker file.
    pub async fn delete_snapshot(&mut self) -> bool {
        info!("deleting snapshot...");
        let result = self.delete_snapshot_inner().await;
        self.remove_snapshot_created_file();
        match result {
            Ok(()) => true,
            Err(e) => {
                error!("delete_snapshot failed: {e}");
                false
            }
        }
    }

    async fn delete_snapshot_inner(&mut self) -> Result<(), QmpError> {
        let mut client = QmpClient::connect(&self.qmp_socket_path).await?;
        let node = self.resolve_node_name(&mut client).await?;
        client
            .execute(
                "snapshot-delete",
                Some(json!({
                    "job-id": snapshot_job_id("delete"),
                    "tag": SNAPSHOT_TAG,
                    "devices": [node],
                })),
            )
            .await?;
        Ok(())
    }

    /// Starts the PC trace hook, writing one PC per line to `trace_log`.
    pub async fn trace_on(&self, trace_log: &Path) -> bool {
        execute_once(
            &self.qmp_socket_path,
            TRACE_START_COMMAND,
            Some(json!({"filename": trace_log.display().to_string()})),
        )
        .await
    }

    /// Stops the PC trace hook.
    pub async fn trace_off(&self) -> bool {
        execute_once(&self.qmp_socket_path, TRACE_STOP_COMMAND, Some(json!({}))).await
    }

    pub fn snapshot_created(&self) -> bool {
        self.snapshot_created_file.exists()
    }

    async fn resolve_node_name(&mut self, client: &mut QmpClient) -> Result<String, QmpError> {
        if let Some(node) = &self.node_name {
            return Ok(node.clone());
        }
        let blocks = client.execute("query-block", None).await?;
        let node = blocks
            .as_array()
            .into_iter()
            .flatten()
            .find(|dev| dev.get("device").and_then(|d| d.as_str()) == Some(SNAPSHOT_DEVICE))
            .and_then(|dev| dev.pointer("/inserted/node-name"))
            .and_then(|node| node.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                QmpError::Protocol(format!("node-name of {SNAPSHOT_DEVICE} not found"))
            })?;
        self.node_name = Some(node.clone());
        Ok(node)
    }

    fn remove_snapshot_storage(&self) {
        if self.snapshot_storage.exists() {
            info!("removing old snapshot overlay");
            if let Err(e) = std::fs::remove_file(&self.snapshot_storage) {
                error!("removing snapshot overlay failed: {e}");
            }
        }
        self.remove_snapshot_created_file();
    }

    fn remove_snapshot_created_file(&self) {
        if self.snapshot_created_file.exists() {
            if let Err(e) = std::fs::remove_file(&self.snapshot_created_file) {
                error!("removing snapshot marker failed: {e}");
            }
        }
    }
}

/// Unique job id for a snapshot job.
fn snapshot_job_id(prefix: &str) -> String {
    let random_part: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    format!("mtcfuzz-snapshot-{prefix}-{random_part}")
}
