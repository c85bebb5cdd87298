//! RISC-V SBI firmware target.
//!
//! The harness is a guest binary driven by a kernel module; one test issues
//! a single `ecall` with the generated register set. Mutated `a7` values
//! that would ask the firmware to shut the VM down are rejected and
//! re-rolled.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fuzzer_data::{Config, FuzzInput, FuzzValue, Seed};
use log::{error, info};
use rand::{Rng, RngCore};

use crate::mutator::{MutateError, Mutator};
use crate::ssh::{ExecResult, SshClient, SshError};
use crate::targets::{basename, FuzzerTarget, RunError, TestContext};
use crate::ConfigError;

/// SRST extension id and the legacy shutdown call; either in `a7` powers
/// the VM off mid-test.
const FORBIDDEN_A7: [u64; 2] = [0x53525354, 0x8];
const MAX_A7_REROLLS: u32 = 16;

const SBI_REGISTERS: [&str; 8] = ["a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7"];

pub struct SbiMutator;

impl Mutator for SbiMutator {}

pub struct SbiTarget {
    config: Arc<Config>,
    task_id: String,
    ssh: SshClient,
    mutator: SbiMutator,
    remote_work_dir: String,
    remote_module_path: String,
    remote_harness_path: String,
}

impl SbiTarget {
    pub fn new(config: Arc<Config>, task_id: &str, ssh: SshClient) -> Result<Self, ConfigError> {
        let remote_work_dir = config.fuzzing.remote_work_dir.clone();
        let module = config
            .fuzzing
            .kernel_module
            .as_deref()
            .ok_or(ConfigError::MissingKey("fuzzing.kernel_module"))?;
        let harness = config
            .fuzzing
            .harness
            .as_deref()
            .ok_or(ConfigError::MissingKey("fuzzing.harness"))?;

        Ok(SbiTarget {
            remote_module_path: format!("{remote_work_dir}/{}", basename(module)),
            remote_harness_path: format!("{remote_work_dir}/{}", basename(harness)),
            remote_work_dir,
            task_id: task_id.to_string(),
            config,
            ssh,
            mutator: SbiMutator,
        })
    }

    fn init_sbi_params() -> FuzzInput {
        SBI_REGISTERS
            .iter()
            .map(|reg| (reg.to_string(), FuzzValue::Hex("0x0".to_string())))
            .collect()
    }

    fn build_command(&self, input: &FuzzInput, ctx: &TestContext) -> String {
        let reg = |name: &str| {
            input
                .get(name)
                .map(FuzzValue::as_arg)
                .unwrap_or_else(|| "0x0".to_string())
        };
        format!(
            "{} -eid {} -fid {} -a0 {} -a1 {} -a2 {} -a3 {} -a4 {} -a5 {} -o {}",
            self.remote_harness_path,
            reg("a7"),
            reg("a6"),
            reg("a0"),
            reg("a1"),
            reg("a2"),
            reg("a3"),
            reg("a4"),
            reg("a5"),
            ctx.remote_test_dir,
        )
    }
}

fn is_forbidden_a7(value: &str) -> bool {
    matches!(fuzzer_data::parse_hex(value), Ok(v) if FORBIDDEN_A7.contains(&v))
}

/// Re-rolls a mutated `a7` a bounded number of times; if the forbidden
/// values persist, falls back to a random non-forbidden value.
fn guard_a7(
    mutator: &dyn Mutator,
    rng: &mut dyn RngCore,
    seed_value: &str,
    mut mutated: String,
) -> Result<String, MutateError> {
    let mut rerolls = 0;
    while is_forbidden_a7(&mutated) && rerolls < MAX_A7_REROLLS {
        mutated = mutator.mutate(rng, seed_value)?;
        rerolls += 1;
    }
    if is_forbidden_a7(&mutated) {
        loop {
            let random: u64 = rng.random();
            if !FORBIDDEN_A7.contains(&random) {
                mutated = format!("{random:#x}");
                break;
            }
        }
    }
    Ok(mutated)
}

#[async_trait]
impl FuzzerTarget for SbiTarget {
    fn name(&self) -> &'static str {
        "sbi"
    }

    fn mutator(&self) -> &dyn Mutator {
        &self.mutator
    }

    fn extra_vm_params(&self) -> Vec<String> {
        Vec::new()
    }

    fn copy_files(&self) -> std::io::Result<Option<PathBuf>> {
        let qemu = &self.config.qemu_params;
        let source = qemu
            .initrd
            .as_deref()
            .or(qemu.rootfs.as_deref())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no initrd or rootfs configured in qemu_params",
                )
            })?;

        let staged = PathBuf::from(&self.config.fuzzing.local_work_dir)
            .join(format!("{}-{}", self.task_id, basename(source)));
        std::fs::copy(source, &staged)?;
        Ok(Some(staged))
    }

    async fn prepare_harness(&self) -> Result<bool, SshError> {
        let result = self
            .ssh
            .exec(&format!("mkdir -p {}", self.remote_work_dir))
            .await?;
        if result.returncode != 0 {
            error!("failed to create remote work directory: {}", self.remote_work_dir);
            return Ok(false);
        }

        if let Some(module) = &self.config.fuzzing.kernel_module {
            self.ssh.send_file(module, &self.remote_module_path).await?;
        }
        if let Some(harness) = &self.config.fuzzing.harness {
            self.ssh.send_file(harness, &self.remote_harness_path).await?;
        }

        let result = self
            .ssh
            .exec(&format!("insmod {}", self.remote_module_path))
            .await?;
        if result.returncode != 0 {
            error!("failed to insert module: {}", self.remote_module_path);
            return Ok(false);
        }

        info!("SBI harness prepared");
        Ok(true)
    }

    fn generate_input(
        &self,
        rng: &mut dyn RngCore,
        seed: &Seed,
    ) -> Result<FuzzInput, MutateError> {
        let mut params = Self::init_sbi_params();
        for (name, field) in seed.iter() {
            let value = if field.fixed {
                FuzzValue::Hex(field.value.clone())
            } else {
                let mut mutated = self.mutator.mutate(rng, &field.value)?;
                if name == "a7" {
                    mutated = guard_a7(&self.mutator, rng, &field.value, mutated)?;
                }
                FuzzValue::Hex(mutated)
            };
            params.insert(name.clone(), value);
        }
        Ok(params)
    }

    async fn run_test(
        &self,
        input: &FuzzInput,
        ctx: &TestContext,
    ) -> Result<ExecResult, RunError> {
        Ok(self.ssh.exec_once(&self.build_command(input, ctx)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_isaac::Isaac64Rng;

    fn config() -> Arc<Config> {
        Arc::new(
            serde_json::from_str(
                r#"{
            "fuzzing": {
                "local_work_dir": "/tmp/w", "seed_dir": "/tmp/s",
                "fuzzer_target": "sbi",
                "assign_energy_function": "aflfast",
                "kernel_module": "/build/sbi_fuzz.ko",
                "harness": "/build/sbi_fuzz_harness"
            },
            "qemu_params": {
                "qemu_path": "qemu-system-riscv64", "machine": "virt",
                "bios": "fw_jump.bin", "kernel": "Image", "append": "",
                "initrd": "/build/rootfs.cpio"
            },
            "address_filters": {"kernel": [], "firmware": []}
        }"#,
            )
            .unwrap(),
        )
    }

    fn target() -> SbiTarget {
        let config = config();
        let ssh = SshClient::new(&config, 10022);
        SbiTarget::new(config, "task-0", ssh).unwrap()
    }

    #[test]
    fn construction_requires_module_and_harness() {
        let mut bare: Config = (*config()).clone();
        bare.fuzzing.kernel_module = None;
        let bare = Arc::new(bare);
        let ssh = SshClient::new(&bare, 10022);
        assert!(matches!(
            SbiTarget::new(bare, "task-0", ssh),
            Err(ConfigError::MissingKey("fuzzing.kernel_module"))
        ));
    }

    #[test]
    fn command_line_carries_all_registers() {
        let target = target();
        let seed = Seed::from_json_str(
            r#"{
            "a7": {"order": 0, "fixed": true, "type": "hex", "value": "0x10"},
            "a6": {"order": 1, "fixed": true, "type": "hex", "value": "0x3"}
        }"#,
        )
        .unwrap();
        let mut rng = Isaac64Rng::seed_from_u64(1);
        let input = target.generate_input(&mut rng, &seed).unwrap();
        let ctx = TestContext {
            remote_test_dir: "/root/work/task-0-x".to_string(),
            local_test_dir: PathBuf::from("/tmp/w/task-0-x"),
        };
        let cmd = target.build_command(&input, &ctx);
        assert_eq!(
            cmd,
            "/root/work/sbi_fuzz_harness -eid 0x10 -fid 0x3 -a0 0x0 -a1 0x0 -a2 0x0 \
             -a3 0x0 -a4 0x0 -a5 0x0 -o /root/work/task-0-x"
        );
    }

    #[test]
    fn unmentioned_registers_default_to_zero() {
        let target = target();
        let seed = Seed::from_json_str(
            r#"{"a7": {"order": 0, "fixed": true, "type": "hex", "value": "0x10"}}"#,
        )
        .unwrap();
        let mut rng = Isaac64Rng::seed_from_u64(2);
        let input = target.generate_input(&mut rng, &seed).unwrap();
        assert_eq!(input["a0"], FuzzValue::Hex("0x0".to_string()));
        assert_eq!(input["a5"], FuzzValue::Hex("0x0".to_string()));
        assert_eq!(input["a7"], FuzzValue::Hex("0x10".to_string()));
    }

    #[test]
    fn forbidden_a7_values_never_survive() {
        let mutator = SbiMutator;
        let mut rng = Isaac64Rng::seed_from_u64(3);
        for seed_value in ["0x53525354", "0x8"] {
            for _ in 0..200 {
                let guarded =
                    guard_a7(&mutator, &mut rng, seed_value, seed_value.to_string()).unwrap();
                assert!(!is_forbidden_a7(&guarded), "forbidden {guarded} survived");
            }
        }
    }

    #[test]
    fn forbidden_detection_matches_both_values() {
        assert!(is_forbidden_a7("0x53525354"));
        assert!(is_forbidden_a7("0x8"));
        assert!(!is_forbidden_a7("0x10"));
        assert!(!is_forbidden_a7("garbage"));
    }
}
