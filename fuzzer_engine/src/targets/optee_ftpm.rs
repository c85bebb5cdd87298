//! OP-TEE fTPM target (nvwrite harness).
//!
//! Tests feed a line-oriented parameter file to a guest harness through the
//! 9p share. The fTPM trusted application is loaded at a runtime-chosen
//! address; the boot console log reveals it, and the firmware filter is
//! widened accordingly so TA coverage is classified.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coverage::{AddressRange, Coverage};
use fuzzer_data::{Config, FuzzInput, FuzzValue, SeedField};
use lazy_static::lazy_static;
use log::{error, info};
use rand::{Rng, RngCore};
use regex::Regex;

use crate::mutator::{MutateError, Mutator};
use crate::ssh::{ExecResult, SshClient, SshError};
use crate::targets::optee::optee_vm_params;
use crate::targets::{basename, copy_tree, FuzzerTarget, RunError, TestContext};
use crate::ConfigError;

const FTPM_TA_UUID: &str = "bc50d971-d4c9-42c4-82cb-343fb7f37896";
const PAGE_MASK: u64 = 4095;
const TPMRM_POLL_ATTEMPTS: u32 = 10;

/// Parameter file line order expected by the nvwrite harness.
const NVWRITE_FIELDS: [&str; 8] = [
    "flags0",
    "flags1",
    "declared_size_delta",
    "offset_delta",
    "authsize_delta",
    "swap_handles",
    "payload_len",
    "payload",
];

lazy_static! {
    static ref FTPM_LOAD_PATTERN: Regex = Regex::new(&format!(
        r"D/LD:\s+ldelf:\d+\s+ELF\s+\({}\)\s+at\s+(0x[0-9a-fA-F]+)",
        regex::escape(FTPM_TA_UUID)
    ))
    .unwrap();
    static ref FTPM_SIZE_PATTERN: Regex = Regex::new(&format!(
        r"D/TC:\d+\s+\d+\s+early_ta_init:\d+\s+Early TA {} size \d+ \(compressed, uncompressed (\d+)\)",
        regex::escape(FTPM_TA_UUID)
    ))
    .unwrap();
}

pub struct OpteeFtpmMutator;

impl Mutator for OpteeFtpmMutator {
    fn custom_mutate(
        &self,
        rng: &mut dyn RngCore,
        field_name: &str,
        _field: &SeedField,
    ) -> Result<String, MutateError> {
        match field_name {
            // One TPMA_NV attribute bit at a time.
            "flag0" => {
                let bits = [1u8, 2, 4, 8];
                Ok(format!("{:#x}", bits[rng.random_range(0..bits.len())]))
            }
            other => Err(MutateError::UnknownKey(other.to_string())),
        }
    }
}

pub struct OpteeFtpmTarget {
    config: Arc<Config>,
    task_id: String,
    ssh: SshClient,
    mutator: OpteeFtpmMutator,
    bin_dir: PathBuf,
    hostshare_dir: PathBuf,
    fuzz_input_file: PathBuf,
    fuzz_input_file_on_remote: String,
    remote_hostshare_dir: String,
    remote_work_dir: String,
    remote_harness_path: String,
    tag_9p: String,
    artifact_dir: String,
}

impl OpteeFtpmTarget {
    pub fn new(config: Arc<Config>, task_id: &str, ssh: SshClient) -> Result<Self, ConfigError> {
        let work_dir = PathBuf::from(&config.fuzzing.local_work_dir);
        let hostshare_dir = work_dir.join(format!("{task_id}-hostshare"));
        let remote_hostshare_dir = config
            .fuzzing
            .hostshare_9p
            .clone()
            .ok_or(ConfigError::MissingKey("fuzzing.hostshare_9p"))?;
        let tag_9p = config
            .fuzzing
            .tag_9p
            .clone()
            .ok_or(ConfigError::MissingKey("fuzzing.tag_9p"))?;
        let artifact_dir = config
            .fuzzing
            .optee_artifact_dir
            .clone()
            .ok_or(ConfigError::MissingKey("fuzzing.optee_artifact_dir"))?;
        let harness = config
            .fuzzing
            .harness
            .as_deref()
            .ok_or(ConfigError::MissingKey("fuzzing.harness"))?;
        let remote_work_dir = config.fuzzing.remote_work_dir.clone();

        Ok(OpteeFtpmTarget {
            bin_dir: work_dir.join(format!("{task_id}-bin")),
            fuzz_input_file: hostshare_dir.join("fuzz_input.txt"),
            fuzz_input_file_on_remote: format!("{remote_hostshare_dir}/fuzz_input.txt"),
            remote_harness_path: format!("{remote_work_dir}/{}", basename(harness)),
            hostshare_dir,
            remote_hostshare_dir,
            remote_work_dir,
            tag_9p,
            artifact_dir,
            task_id: task_id.to_string(),
            config,
            ssh,
            mutator: OpteeFtpmMutator,
        })
    }

    fn nvwrite_parameter_lines(input: &FuzzInput) -> String {
        let mut lines = String::new();
        for field in NVWRITE_FIELDS {
            let value = input.get(field).map(FuzzValue::as_arg).unwrap_or_default();
            lines.push_str(&value);
            lines.push('\n');
        }
        lines
    }

    async fn wait_for_tpmrm0(&self) -> Result<bool, SshError> {
        for _ in 0..TPMRM_POLL_ATTEMPTS {
            let result = self.ssh.exec("ls /dev/tpmrm0").await?;
            if result.returncode == 0 {
                return Ok(true);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(false)
    }
}

/// Extracts the fTPM TA region from a boot console log: load address from
/// the ldelf line, page-aligned size from the early-TA line.
fn parse_ta_region(log: &str) -> Option<AddressRange> {
    let address = FTPM_LOAD_PATTERN
        .captures(log)
        .and_then(|captures| captures.get(1))
        .and_then(|m| fuzzer_data::parse_hex(m.as_str()).ok())?;
    let size = FTPM_SIZE_PATTERN
        .captures(log)
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())?;

    let aligned_size = (size + PAGE_MASK) & !PAGE_MASK;
    Some(AddressRange::new(address, address + aligned_size))
}

#[async_trait]
impl FuzzerTarget for OpteeFtpmTarget {
    fn name(&self) -> &'static str {
        "optee_ftpm"
    }

    fn mutator(&self) -> &dyn Mutator {
        &self.mutator
    }

    fn extra_vm_params(&self) -> Vec<String> {
        optee_vm_params(&self.hostshare_dir)
    }

    fn working_dir(&self) -> Option<PathBuf> {
        Some(self.bin_dir.clone())
    }

    fn copy_files(&self) -> std::io::Result<Option<PathBuf>> {
        copy_tree(std::path::Path::new(&self.artifact_dir), &self.bin_dir)?;
        std::fs::create_dir_all(&self.hostshare_dir)?;
        Ok(None)
    }

    async fn prepare_harness(&self) -> Result<bool, SshError> {
        let result = self
            .ssh
            .exec_once(&format!("mkdir -p {}", self.remote_hostshare_dir))
            .await?;
        if result.returncode != 0 {
            error!(
                "failed to create remote 9p directory: {}",
                self.remote_hostshare_dir
            );
            return Ok(false);
        }

        let result = self
            .ssh
            .exec_once(&format!(
                "mount -t 9p -o trans=virtio {} {}",
                self.tag_9p, self.remote_hostshare_dir
            ))
            .await?;
        if result.returncode != 0 {
            error!("failed to mount 9p share at {}", self.remote_hostshare_dir);
            return Ok(false);
        }

        let result = self
            .ssh
            .exec(&format!("mkdir -p {}", self.remote_work_dir))
            .await?;
        if result.returncode != 0 {
            error!("failed to create remote work directory: {}", self.remote_work_dir);
            return Ok(false);
        }

        if let Some(harness) = &self.config.fuzzing.harness {
            let result = self.ssh.send_file(harness, &self.remote_harness_path).await?;
            if result.returncode != 0 {
                error!("failed to copy test harness");
                return Ok(false);
            }
        }

        if !self.wait_for_tpmrm0().await? {
            error!("/dev/tpmrm0 did not appear");
            return Ok(false);
        }

        info!("fTPM harness prepared");
        Ok(true)
    }

    fn extra_setup(&self, coverage: &mut Coverage) {
        let console1_log = PathBuf::from(&self.config.fuzzing.local_work_dir)
            .join(format!("{}-console1.log", self.task_id));
        let log = match std::fs::read_to_string(&console1_log) {
            Ok(log) => log,
            Err(e) => {
                info!("boot console log {} not readable: {e}", console1_log.display());
                return;
            }
        };

        match parse_ta_region(&log) {
            Some(range) => {
                info!(
                    "fTPM TA ({FTPM_TA_UUID}) located at {:#x}, region end {:#x}",
                    range.lower, range.upper
                );
                coverage.append_firmware_range(range);
            }
            None => {
                info!("{FTPM_TA_UUID} load address or size not determined");
            }
        }
    }

    async fn run_test(
        &self,
        input: &FuzzInput,
        ctx: &TestContext,
    ) -> Result<ExecResult, RunError> {
        std::fs::write(&self.fuzz_input_file, Self::nvwrite_parameter_lines(input))?;
        std::fs::copy(
            &self.fuzz_input_file,
            ctx.local_test_dir.join("fuzz_input.txt"),
        )?;

        let cmd = format!(
            "{} --target nvwrite --in {}",
            self.remote_harness_path, self.fuzz_input_file_on_remote
        );
        let result = self
            .ssh
            .exec_once_with_timeout(&cmd, Duration::from_secs(5))
            .await?;
        Ok(result)
    }
}
