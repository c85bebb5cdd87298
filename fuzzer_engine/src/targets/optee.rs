//! OP-TEE xtest target.
//!
//! The guest mounts a 9p host share; each test writes its parameters as a
//! comma-joined line into `fuzz_input.txt` on the share and invokes the
//! fuzzing xtest case.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fuzzer_data::{Config, FuzzInput, FuzzValue, Seed};
use itertools::Itertools;
use log::info;

use crate::mutator::Mutator;
use crate::ssh::{ExecResult, SshClient, SshError};
use crate::targets::{copy_tree, FuzzerTarget, RunError, TestContext};
use crate::ConfigError;

pub struct OpteeMutator;

impl Mutator for OpteeMutator {}

pub struct OpteeTarget {
    ssh: SshClient,
    mutator: OpteeMutator,
    /// Emulator working directory with the staged artifact tree.
    bin_dir: PathBuf,
    hostshare_dir: PathBuf,
    fuzz_input_file: PathBuf,
    remote_hostshare_dir: String,
    tag_9p: String,
    artifact_dir: String,
}

impl OpteeTarget {
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

        Ok(OpteeTarget {
            bin_dir: work_dir.join(format!("{task_id}-bin")),
            fuzz_input_file: hostshare_dir.join("fuzz_input.txt"),
            hostshare_dir,
            remote_hostshare_dir,
            tag_9p,
            artifact_dir,
            ssh,
            mutator: OpteeMutator,
        })
    }

    /// All parameters except the case selector, comma-joined in seed order.
    fn xtest_input_line(input: &FuzzInput) -> String {
        input
            .iter()
            .filter(|(name, _)| name.as_str() != "xtest_number")
            .map(|(_, value)| value.as_arg())
            .join(",")
    }
}

/// Shared between the plain OP-TEE and the fTPM target.
pub(crate) fn optee_vm_params(hostshare_dir: &std::path::Path) -> Vec<String> {
    vec![
        "-cpu".to_string(),
        "max,sme=on,pauth-impdef=on".to_string(),
        "-d".to_string(),
        "unimp".to_string(),
        "-semihosting-config".to_string(),
        "enable=on,target=native".to_string(),
        "-fsdev".to_string(),
        format!(
            "local,id=fsdev0,path={},security_model=none",
            hostshare_dir.display()
        ),
        "-device".to_string(),
        "virtio-9p-device,fsdev=fsdev0,mount_tag=hostshare".to_string(),
    ]
}

#[async_trait]
impl FuzzerTarget for OpteeTarget {
    fn name(&self) -> &'static str {
        "optee"
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
        self.ssh
            .exec_once(&format!("mkdir -p {}", self.remote_hostshare_dir))
            .await?;
        self.ssh
            .exec_once(&format!(
                "mount -t 9p -o trans=virtio {} {}",
                self.tag_9p, self.remote_hostshare_dir
            ))
            .await?;
        info!("OP-TEE hostshare mounted at {}", self.remote_hostshare_dir);
        Ok(true)
    }

    /// Only the command id feeds back into the corpus.
    fn create_new_seed(&self, parent: &Seed, params: &FuzzInput) -> Seed {
        let mut new_seed = parent.clone();
        if let (Some(field), Some(value)) = (new_seed.0.get_mut("cmd_id"), params.get("cmd_id")) {
            field.value = value.as_seed_value();
        }
        new_seed
    }

    async fn run_test(
        &self,
        input: &FuzzInput,
        _ctx: &TestContext,
    ) -> Result<ExecResult, RunError> {
        std::fs::write(&self.fuzz_input_file, Self::xtest_input_line(input))?;

        let xtest_number = input
            .get("xtest_number")
            .map(FuzzValue::as_arg)
            .unwrap_or_default();
        let result = self
            .ssh
            .exec_once(&format!("xtest -t fuzz {xtest_number}"))
            .await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Arc<Config> {
        Arc::new(
            serde_json::from_str(
                r#"{
            "fuzzing": {
                "local_work_dir": "/tmp/w", "seed_dir": "/tmp/s",
                "fuzzer_target": "optee",
                "assign_energy_function": "aflfast",
                "hostshare_9p": "/mnt/hostshare",
                "tag_9p": "hostshare",
                "optee_artifact_dir": "/build/optee-artifacts"
            },
            "qemu_params": {
                "qemu_path": "qemu-system-aarch64", "machine": "virt,secure=on",
                "bios": "flash.bin", "kernel": "Image", "append": ""
            },
            "address_filters": {"kernel": [], "firmware": []}
        }"#,
            )
            .unwrap(),
        )
    }

    fn target() -> OpteeTarget {
        let config = config();
        let ssh = SshClient::new(&config, 10022);
        OpteeTarget::new(config, "task-0", ssh).unwrap()
    }

    #[test]
    fn construction_requires_the_9p_share() {
        let mut bare: Config = (*config()).clone();
        bare.fuzzing.hostshare_9p = None;
        let bare = Arc::new(bare);
        let ssh = SshClient::new(&bare, 10022);
        assert!(matches!(
            OpteeTarget::new(bare, "task-0", ssh),
            Err(ConfigError::MissingKey("fuzzing.hostshare_9p"))
        ));
    }

    #[test]
    fn vm_params_attach_the_hostshare() {
        let target = target();
        let joined = target.extra_vm_params().join(" ");
        assert!(joined.contains("-fsdev local,id=fsdev0,path=/tmp/w/task-0-hostshare,security_model=none"));
        assert!(joined.contains("virtio-9p-device,fsdev=fsdev0,mount_tag=hostshare"));
        assert!(joined.contains("-semihosting-config enable=on,target=native"));
    }

    #[test]
    fn input_line_skips_the_case_selector() {
        let mut input = FuzzInput::new();
        input.insert("xtest_number".to_string(), FuzzValue::Int(1001));
        input.insert("cmd_id".to_string(), FuzzValue::Hex("0x2a".to_string()));
        input.insert("len".to_string(), FuzzValue::Hex("0x10".to_string()));
        assert_eq!(OpteeTarget::xtest_input_line(&input), "0x2a,0x10");
    }

    #[test]
    fn new_seed_takes_only_the_command_id() {
        let target = target();
        let parent = Seed::from_json_str(
            r#"{
            "xtest_number": {"order": 0, "fixed": true, "type": "int", "value": "1001"},
            "cmd_id": {"order": 1, "fixed": false, "type": "hex", "value": "0x1"},
            "len": {"order": 2, "fixed": false, "type": "hex", "value": "0x8"}
        }"#,
        )
        .unwrap();
        let mut params = FuzzInput::new();
        params.insert("cmd_id".to_string(), FuzzValue::Hex("0x7".to_string()));
        params.insert("len".to_string(), FuzzValue::Hex("0x9".to_string()));

        let new_seed = target.create_new_seed(&parent, &params);
        assert_eq!(new_seed.get("cmd_id").unwrap().value, "0x7");
        assert_eq!(new_seed.get("len").unwrap().value, "0x8");
    }

    #[test]
    fn working_dir_is_the_staged_artifact_tree() {
        assert_eq!(
            target().working_dir(),
            Some(PathBuf::from("/tmp/w/task-0-bin"))
        );
    }
}
