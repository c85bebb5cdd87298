//! Configuration file model.
//!
//! The engine is configured through a single JSON document with `fuzzing`,
//! `qemu_params`, `ssh_params` and `address_filters` sections. Unknown
//! target names, energy functions and the like are rejected when the
//! respective component is constructed, not here.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub fuzzing: FuzzingConfig,
    pub qemu_params: QemuParams,
    #[serde(default)]
    pub ssh_params: SshParams,
    pub address_filters: AddressFilters,
    /// When set the emulator inherits stdio instead of being silenced.
    #[serde(default)]
    pub debug: bool,
}

impl Config {
    /// Reads a configuration document from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config = serde_json::from_reader(reader)?;
        Ok(config)
    }

    /// Writes the effective configuration to `updated-config.json` in the
    /// local work directory (4-space indent).
    pub fn save_updated(&self) -> std::io::Result<()> {
        let path = Path::new(&self.fuzzing.local_work_dir).join("updated-config.json");
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        let mut serializer = serde_json::Serializer::with_formatter(
            writer,
            serde_json::ser::PrettyFormatter::with_indent(b"    "),
        );
        self.serialize(&mut serializer)?;
        Ok(())
    }
}

/// The `fuzzing` section: engine behavior and guest harness locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzingConfig {
    /// Host directory receiving per-test artifacts, sockets and logs.
    pub local_work_dir: String,
    /// Guest directory the harness and per-test outputs live in.
    #[serde(default = "default_remote_work_dir")]
    pub remote_work_dir: String,
    /// Directory of JSON seed templates, scanned recursively.
    pub seed_dir: String,
    /// Registry name of the fuzzer target (`sbi`, `optee`, `optee_ftpm`).
    pub fuzzer_target: String,
    #[serde(default = "default_num_fuzzers")]
    pub num_fuzzers: usize,
    #[serde(default = "default_max_fuzzing_loop")]
    pub max_fuzzing_loop: u64,
    /// Seconds to wait for the emulator on a cold boot.
    #[serde(default = "default_wait_for_qemu_seconds")]
    pub wait_for_qemu_seconds: f64,
    /// `M`: the energy ceiling and the constant for the `simple` policy.
    #[serde(default = "default_energy")]
    pub default_energy: f64,
    /// Energy policy name: `aflfast` or `simple`.
    pub assign_energy_function: String,
    #[serde(default = "default_ssh_retry_max")]
    pub ssh_retry_max: u32,
    /// Per-attempt timeout for remote commands, in seconds.
    #[serde(default = "default_remote_command_exec_timeout")]
    pub remote_command_exec_timeout: f64,
    #[serde(default)]
    pub ignore_kernel_coverage: bool,
    #[serde(default)]
    pub ignore_firmware_coverage: bool,
    /// Host path of the kernel module staged into the guest, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_module: Option<String>,
    /// Host path of the harness binary staged into the guest, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harness: Option<String>,
    #[serde(default = "default_machine_info_dir")]
    pub machine_info_dir: String,
    #[serde(default = "default_snapshot_storage_size")]
    pub qemu_snapshot_storage_size: String,
    #[serde(default)]
    pub use_gdb: bool,
    #[serde(default = "default_gdb_port")]
    pub gdb_port: u16,
    /// Guest mount point of the 9p host share (OP-TEE targets).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostshare_9p: Option<String>,
    /// Mount tag of the 9p host share (OP-TEE targets).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_9p: Option<String>,
    /// Host directory with the prebuilt OP-TEE artifact tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optee_artifact_dir: Option<String>,
}

/// The `qemu_params` section: emulator binary, firmware and guest wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QemuParams {
    pub qemu_path: String,
    pub machine: String,
    pub bios: String,
    pub kernel: String,
    pub append: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<String>,
    #[serde(default = "default_smp")]
    pub smp: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    /// Address the guest reaches the host under (user-mode networking).
    #[serde(default = "default_qemu_host")]
    pub host: String,
    /// Base TCP port forwarded to guest SSH; workers add their task index.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Attach a second serial socket and drain it alongside the first.
    #[serde(default)]
    pub extra_serial: bool,
}

/// The `ssh_params` section: how to reach the guest harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshParams {
    #[serde(default = "default_ssh_host")]
    pub host: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl Default for SshParams {
    fn default() -> Self {
        SshParams {
            host: default_ssh_host(),
            user: default_ssh_user(),
            identity: None,
        }
    }
}

/// The `address_filters` section: PC regions per category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressFilters {
    #[serde(default)]
    pub kernel: Vec<AddressFilterEntry>,
    #[serde(default)]
    pub firmware: Vec<AddressFilterEntry>,
}

/// One closed `[lower, upper]` address interval, hex-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressFilterEntry {
    pub lower: String,
    pub upper: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn default_remote_work_dir() -> String {
    "/root/work".to_string()
}

fn default_num_fuzzers() -> usize {
    1
}

fn default_max_fuzzing_loop() -> u64 {
    1000
}

fn default_wait_for_qemu_seconds() -> f64 {
    5.0
}

fn default_energy() -> f64 {
    100.0
}

fn default_ssh_retry_max() -> u32 {
    5
}

fn default_remote_command_exec_timeout() -> f64 {
    2.0
}

fn default_machine_info_dir() -> String {
    "machine_info".to_string()
}

fn default_snapshot_storage_size() -> String {
    "4G".to_string()
}

fn default_gdb_port() -> u16 {
    1234
}

fn default_smp() -> String {
    "1".to_string()
}

fn default_memory() -> String {
    "1024".to_string()
}

fn default_qemu_host() -> String {
    "10.0.2.2".to_string()
}

fn default_ssh_port() -> u16 {
    10022
}

fn default_ssh_host() -> String {
    "localhost".to_string()
}

fn default_ssh_user() -> String {
    "root".to_string()
}
