//! Fuzzer targets.
//!
//! A target owns everything harness-specific: extra emulator flags, file
//! staging, guest preparation, input construction from a seed and the test
//! invocation ABI. The engine holds the target as a trait object resolved
//! from the configuration at startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use coverage::Coverage;
use fuzzer_data::{Config, FieldKind, FuzzInput, FuzzValue, Seed};
use rand::RngCore;

use crate::mutator::{MutateError, Mutator};
use crate::ssh::{ExecResult, SshClient, SshError};
use crate::ConfigError;

pub mod optee;
pub mod optee_ftpm;
pub mod sbi;

pub use optee::OpteeTarget;
pub use optee_ftpm::OpteeFtpmTarget;
pub use sbi::SbiTarget;

/// Why a test invocation failed. Transport failures count as possible
/// crashes; local staging failures are worker errors.
#[derive(Debug)]
pub enum RunError {
    Ssh(SshError),
    Io(std::io::Error),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Ssh(e) => write!(f, "{e}"),
            RunError::Io(e) => write!(f, "staging test input failed: {e}"),
        }
    }
}

impl std::error::Error for RunError {}

impl From<SshError> for RunError {
    fn from(error: SshError) -> Self {
        RunError::Ssh(error)
    }
}

impl From<std::io::Error> for RunError {
    fn from(error: std::io::Error) -> Self {
        RunError::Io(error)
    }
}

/// Per-test directory locations a `run_test` invocation may use.
#[derive(Debug, Clone)]
pub struct TestContext {
    /// Guest-side test directory (already created).
    pub remote_test_dir: String,
    /// Host-side test directory (already created).
    pub local_test_dir: PathBuf,
}

/// Target-specific harness behavior. One implementation per guest setup.
#[async_trait]
pub trait FuzzerTarget: Send + Sync {
    fn name(&self) -> &'static str;

    /// The mutation family used by the generic input construction.
    fn mutator(&self) -> &dyn Mutator;

    /// Additional emulator command-line parameters.
    fn extra_vm_params(&self) -> Vec<String>;

    /// Working directory the emulator should run in, if any.
    fn working_dir(&self) -> Option<PathBuf> {
        None
    }

    /// Stages files into the local work directory before first boot.
    /// Returns the staged guest disk image, when the target uses one.
    fn copy_files(&self) -> std::io::Result<Option<PathBuf>>;

    /// Sets the guest up for test execution (modules, mounts, harness
    /// binaries). `Ok(false)` means a setup command failed.
    async fn prepare_harness(&self) -> Result<bool, SshError>;

    /// Optional post-boot hook, e.g. widening the firmware filter from the
    /// boot console log. Failures are logged by the implementation and the
    /// extra coverage is forgone.
    fn extra_setup(&self, _coverage: &mut Coverage) {}

    /// Builds the concrete parameter map for one test from a seed.
    fn generate_input(
        &self,
        rng: &mut dyn RngCore,
        seed: &Seed,
    ) -> Result<FuzzInput, MutateError> {
        generate_input_generic(self.mutator(), rng, seed)
    }

    /// Derives the corpus seed a successful mutated test is stored as:
    /// the parent's field map with the generated values overlaid.
    fn create_new_seed(&self, parent: &Seed, params: &FuzzInput) -> Seed {
        overlay_params(parent, params)
    }

    /// Serializes `input` according to the target ABI and invokes the
    /// harness on the guest.
    async fn run_test(&self, input: &FuzzInput, ctx: &TestContext)
        -> Result<ExecResult, RunError>;
}

/// Resolves the configured target name. Unknown names are a startup error.
pub fn create_target(
    config: &Arc<Config>,
    task_id: &str,
    ssh: SshClient,
) -> Result<Box<dyn FuzzerTarget>, ConfigError> {
    match config.fuzzing.fuzzer_target.as_str() {
        "sbi" => Ok(Box::new(SbiTarget::new(Arc::clone(config), task_id, ssh)?)),
        "optee" => Ok(Box::new(OpteeTarget::new(Arc::clone(config), task_id, ssh)?)),
        "optee_ftpm" => Ok(Box::new(OpteeFtpmTarget::new(
            Arc::clone(config),
            task_id,
            ssh,
        )?)),
        other => Err(ConfigError::UnknownTarget(other.to_string())),
    }
}

/// Default input construction: fixed fields pass through typed, the rest
/// dispatch on the custom tag and the type tag.
pub fn generate_input_generic(
    mutator: &dyn Mutator,
    rng: &mut dyn RngCore,
    seed: &Seed,
) -> Result<FuzzInput, MutateError> {
    let mut params = FuzzInput::new();
    for (name, field) in seed.iter() {
        let value = if field.fixed {
            fixed_value(field.kind, &field.value)?
        } else if field.mutator.as_deref() == Some("custom") {
            FuzzValue::Hex(mutator.custom_mutate(rng, name, field)?)
        } else if field.kind == FieldKind::Str {
            let min = field
                .min_len
                .as_deref()
                .ok_or_else(|| MutateError::InvalidValue(format!("{name}: missing min_len")))?;
            let max = field
                .max_len
                .as_deref()
                .ok_or_else(|| MutateError::InvalidValue(format!("{name}: missing max_len")))?;
            FuzzValue::Str(mutator.mutate_string(rng, &field.value, min, max)?)
        } else {
            FuzzValue::Hex(mutator.mutate(rng, &field.value)?)
        };
        params.insert(name.clone(), value);
    }
    Ok(params)
}

/// The typed value of a pinned field.
fn fixed_value(kind: FieldKind, value: &str) -> Result<FuzzValue, MutateError> {
    match kind {
        FieldKind::Int => {
            let parsed = if value.starts_with("0x") || value.starts_with("0X") {
                fuzzer_data::parse_hex(value).ok().map(|v| v as i64)
            } else {
                value.parse::<i64>().ok()
            };
            parsed
                .map(FuzzValue::Int)
                .ok_or_else(|| MutateError::InvalidValue(value.to_string()))
        }
        FieldKind::Hex => Ok(FuzzValue::Hex(value.to_string())),
        FieldKind::Str => Ok(FuzzValue::Str(value.to_string())),
    }
}

/// Deep-copies the parent seed and overlays the generated values.
pub fn overlay_params(parent: &Seed, params: &FuzzInput) -> Seed {
    let mut new_seed = parent.clone();
    for (name, field) in new_seed.0.iter_mut() {
        if let Some(value) = params.get(name) {
            field.value = value.as_seed_value();
        }
    }
    new_seed
}

/// Basename of a configured host path; used to derive guest-side paths.
pub(crate) fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Recursive directory copy for artifact staging.
pub(crate) fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let destination = to.join(entry.file_name());
        if source.is_dir() {
            copy_tree(&source, &destination)?;
        } else {
            std::fs::copy(&source, &destination)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_isaac::Isaac64Rng;

    struct PlainMutator;
    impl Mutator for PlainMutator {}

    fn rng() -> Isaac64Rng {
        Isaac64Rng::seed_from_u64(7)
    }

    #[test]
    fn fixed_fields_pass_through_typed() {
        let seed = Seed::from_json_str(
            r#"{
            "xtest_number": {"order": 0, "fixed": true, "type": "int", "value": "1001"},
            "cmd_id": {"order": 1, "fixed": true, "type": "hex", "value": "0x2a"},
            "label": {"order": 2, "fixed": true, "type": "str", "value": "6e76"}
        }"#,
        )
        .unwrap();
        let params = generate_input_generic(&PlainMutator, &mut rng(), &seed).unwrap();
        assert_eq!(params["xtest_number"], FuzzValue::Int(1001));
        assert_eq!(params["cmd_id"], FuzzValue::Hex("0x2a".to_string()));
        assert_eq!(params["label"], FuzzValue::Str("6e76".to_string()));
    }

    #[test]
    fn non_fixed_hex_fields_are_mutated() {
        let seed = Seed::from_json_str(
            r#"{"a0": {"order": 0, "fixed": false, "type": "hex", "value": "0x100"}}"#,
        )
        .unwrap();
        let mut rng = rng();
        let mut changed = false;
        for _ in 0..50 {
            let params = generate_input_generic(&PlainMutator, &mut rng, &seed).unwrap();
            match &params["a0"] {
                FuzzValue::Hex(v) => {
                    if v != "0x100" {
                        changed = true;
                    }
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(changed, "50 mutations never changed the value");
    }

    #[test]
    fn str_fields_without_bounds_are_rejected() {
        let seed = Seed::from_json_str(
            r#"{"payload": {"order": 0, "fixed": false, "type": "str", "value": "00"}}"#,
        )
        .unwrap();
        assert!(generate_input_generic(&PlainMutator, &mut rng(), &seed).is_err());
    }

    #[test]
    fn overlay_replaces_only_present_fields() {
        let parent = Seed::from_json_str(
            r#"{
            "a": {"order": 0, "fixed": true, "type": "hex", "value": "0x1"},
            "b": {"order": 1, "fixed": false, "type": "hex", "value": "0x2"}
        }"#,
        )
        .unwrap();
        let mut params = FuzzInput::new();
        params.insert("b".to_string(), FuzzValue::Hex("0x3".to_string()));

        let new_seed = overlay_params(&parent, &params);
        assert_eq!(new_seed.get("a").unwrap().value, "0x1");
        assert_eq!(new_seed.get("b").unwrap().value, "0x3");
        // the parent stays untouched
        assert_eq!(parent.get("b").unwrap().value, "0x2");
    }

    #[test]
    fn unknown_target_name_is_rejected() {
        let config: Arc<Config> = Arc::new(
            serde_json::from_str(
                r#"{
            "fuzzing": {
                "local_work_dir": "/tmp/w", "seed_dir": "/tmp/s",
                "fuzzer_target": "does-not-exist",
                "assign_energy_function": "simple"
            },
            "qemu_params": {
                "qemu_path": "qemu", "machine": "virt", "bios": "b",
                "kernel": "k", "append": ""
            },
            "address_filters": {"kernel": [], "firmware": []}
        }"#,
            )
            .unwrap(),
        );
        let ssh = SshClient::new(&config, 10022);
        assert!(matches!(
            create_target(&config, "task-0", ssh),
            Err(ConfigError::UnknownTarget(name)) if name == "does-not-exist"
        ));
    }

    #[test]
    fn basename_strips_directories() {
        assert_eq!(basename("/path/to/harness.bin"), "harness.bin");
        assert_eq!(basename("harness.bin"), "harness.bin");
    }
}
