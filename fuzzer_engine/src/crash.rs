//! Crashing-input bookkeeping.

use std::path::Path;
use std::sync::Arc;

use fuzzer_data::FuzzInput;
use serde::Serialize;
use tokio::sync::Mutex;

/// Append-only list of crashing inputs, shared by every worker.
#[derive(Debug, Clone, Default)]
pub struct CrashStore {
    testcases: Arc<Mutex<Vec<FuzzInput>>>,
}

impl CrashStore {
    pub fn new() -> Self {
        CrashStore::default()
    }

    /// Records a crashing input. The lock is held for the push only.
    pub async fn add(&self, input: FuzzInput) {
        let mut testcases = self.testcases.lock().await;
        testcases.push(input);
    }

    pub async fn len(&self) -> usize {
        self.testcases.lock().await.len()
    }

    /// Writes `saved_seed.json` (4-space indent) and a `crashed.txt`
    /// marker naming the test directory into `test_dir`.
    pub fn persist(test_dir: &Path, input: &FuzzInput) -> std::io::Result<()> {
        let file = std::fs::File::create(test_dir.join("saved_seed.json"))?;
        let writer = std::io::BufWriter::new(file);
        let mut serializer = serde_json::Serializer::with_formatter(
            writer,
            serde_json::ser::PrettyFormatter::with_indent(b"    "),
        );
        input.serialize(&mut serializer)?;

        let test_dir_name = test_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        std::fs::write(test_dir.join("crashed.txt"), test_dir_name)?;
        Ok(())
    }
}
