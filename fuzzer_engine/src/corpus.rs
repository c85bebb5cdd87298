//! Seed corpus: structured seed storage and bookkeeping.
//!
//! Seeds load once at startup from a directory of JSON templates (scanned
//! recursively) and are never deleted. New seeds are inserted whenever a
//! test covers a previously unseen kernel or firmware PC.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use coverage::PcMap;
use fuzzer_data::Seed;
use indexmap::IndexMap;
use log::{info, warn};
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

use crate::ConfigError;

/// Corpus entry: one seed plus its execution bookkeeping.
#[derive(Debug, Clone)]
pub struct SeedRecord {
    pub id: String,
    pub seed: Seed,
    /// First observed execution cost in µs; 0 until a test reports one.
    pub elapsed_us: u64,
    /// Kernel PC map captured when this seed was inserted.
    pub traced_pcs_a: PcMap,
    /// Firmware PC map captured when this seed was inserted.
    pub traced_pcs_b: PcMap,
    pub total_trace_length: usize,
    pub total_tested_count: u64,
    pub total_same_coverage_seed_count: usize,
    pub coverage_hash: Option<String>,
}

impl SeedRecord {
    fn template(id: String, seed: Seed) -> Self {
        SeedRecord {
            id,
            seed,
            elapsed_us: 0,
            traced_pcs_a: PcMap::new(),
            traced_pcs_b: PcMap::new(),
            total_trace_length: 0,
            total_tested_count: 0,
            total_same_coverage_seed_count: 0,
            coverage_hash: None,
        }
    }
}

#[derive(Debug)]
pub enum CorpusError {
    Io(std::io::Error),
    NoSeeds(PathBuf),
}

impl fmt::Display for CorpusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorpusError::Io(e) => write!(f, "seed directory error: {e}"),
            CorpusError::NoSeeds(dir) => write!(f, "no seed files under {}", dir.display()),
        }
    }
}

impl std::error::Error for CorpusError {}

impl From<std::io::Error> for CorpusError {
    fn from(error: std::io::Error) -> Self {
        CorpusError::Io(error)
    }
}

impl From<CorpusError> for ConfigError {
    fn from(error: CorpusError) -> Self {
        match error {
            CorpusError::Io(e) => ConfigError::Io(e),
            CorpusError::NoSeeds(dir) => ConfigError::NoSeeds(dir),
        }
    }
}

/// Per-worker seed storage keyed by content-derived seed id.
#[derive(Debug)]
pub struct SeedCorpus {
    task_id: String,
    seeds: IndexMap<String, SeedRecord>,
}

impl SeedCorpus {
    /// Loads every `*.json` under `seed_dir` (recursively). Malformed seed
    /// files are skipped with a warning; an empty corpus is a startup error.
    pub fn load<P: AsRef<Path>>(seed_dir: P, task_id: &str) -> Result<Self, CorpusError> {
        let seed_dir = seed_dir.as_ref();
        let mut corpus = SeedCorpus {
            task_id: task_id.to_string(),
            seeds: IndexMap::new(),
        };

        let mut files = Vec::new();
        collect_json_files(seed_dir, &mut files)?;
        files.sort();

        for path in &files {
            let body = fs::read_to_string(path)?;
            match Seed::from_json_str(&body) {
                Ok(seed) => {
                    let id = corpus.create_seed_id(&seed);
                    info!("loaded seed {} from {}", id, path.display());
                    corpus.seeds.insert(id.clone(), SeedRecord::template(id, seed));
                }
                Err(e) => {
                    warn!("skipping malformed seed file {}: {}", path.display(), e);
                }
            }
        }

        if corpus.seeds.is_empty() {
            return Err(CorpusError::NoSeeds(seed_dir.to_path_buf()));
        }
        Ok(corpus)
    }

    /// Content hash of a seed, prefixed with the worker's task id.
    pub fn create_seed_id(&self, seed: &Seed) -> String {
        let digest = Sha256::digest(seed.canonical_json().as_bytes());
        format!("{}-{:x}", self.task_id, digest)
    }

    /// Picks a seed uniformly, counts the selection as a test, and returns
    /// its id. `None` when the corpus is empty.
    pub fn pick_random(&mut self, rng: &mut dyn RngCore) -> Option<String> {
        if self.seeds.is_empty() {
            return None;
        }
        let idx = rng.random_range(0..self.seeds.len());
        let record = &mut self.seeds[idx];
        record.total_tested_count += 1;
        Some(record.id.clone())
    }

    pub fn get(&self, id: &str) -> Option<&SeedRecord> {
        self.seeds.get(id)
    }

    /// Inserts the seed a mutated test produced, unless it is
    /// indistinguishable from its parent (same field map, same coverage
    /// maps) — that case counts as a re-test of the parent.
    pub fn add(
        &mut self,
        parent_id: &str,
        new_seed: Seed,
        elapsed_us: u64,
        kernel: &PcMap,
        firmware: &PcMap,
    ) {
        let Some(parent) = self.seeds.get(parent_id) else {
            warn!("add: unknown parent seed {parent_id}");
            return;
        };

        if parent.seed == new_seed
            && &parent.traced_pcs_a == kernel
            && &parent.traced_pcs_b == firmware
        {
            self.update(parent_id, elapsed_us);
            return;
        }

        let new_id = self.create_seed_id(&new_seed);
        let record = SeedRecord {
            id: new_id.clone(),
            seed: new_seed,
            elapsed_us: elapsed_us.max(1),
            traced_pcs_a: kernel.clone(),
            traced_pcs_b: firmware.clone(),
            total_trace_length: kernel.len() + firmware.len(),
            total_tested_count: 1,
            total_same_coverage_seed_count: 0,
            coverage_hash: None,
        };
        info!("added new seed: {new_id}");
        self.seeds.insert(new_id, record);
    }

    /// Counts a re-test; the first reported execution cost sticks.
    pub fn update(&mut self, id: &str, elapsed_us: u64) {
        if let Some(record) = self.seeds.get_mut(id) {
            if record.elapsed_us == 0 {
                record.elapsed_us = elapsed_us;
            }
            record.total_tested_count += 1;
        }
    }

    /// Stores the most recent trace fingerprint and the count of other
    /// seeds sharing it.
    pub fn update_hash(&mut self, id: &str, fingerprint: &str, others: usize) {
        if let Some(record) = self.seeds.get_mut(id) {
            record.coverage_hash = Some(fingerprint.to_string());
            record.total_same_coverage_seed_count = others;
        }
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }
}

fn collect_json_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_json_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_isaac::Isaac64Rng;
    use std::fs;

    const PARENT: &str = r#"{
        "a": {"order": 0, "fixed": true, "type": "hex", "value": "0x1"},
        "b": {"order": 1, "fixed": false, "type": "hex", "value": "0x2"}
    }"#;

    fn corpus_with_parent() -> (tempfile::TempDir, SeedCorpus, String) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("seed0.json"), PARENT).unwrap();
        let corpus = SeedCorpus::load(dir.path(), "task-0").unwrap();
        let parent_id = corpus.seeds.keys().next().unwrap().clone();
        (dir, corpus, parent_id)
    }

    fn seed_with_b(value: &str) -> Seed {
        let json = PARENT.replace("\"0x2\"", &format!("{value:?}"));
        Seed::from_json_str(&json).unwrap()
    }

    #[test]
    fn load_scans_recursively_and_skips_malformed() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/seed.json"), PARENT).unwrap();
        fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        fs::write(dir.path().join("ignored.txt"), "nope").unwrap();

        let corpus = SeedCorpus::load(dir.path(), "task-0").unwrap();
        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn empty_seed_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SeedCorpus::load(dir.path(), "task-0"),
            Err(CorpusError::NoSeeds(_))
        ));
    }

    #[test]
    fn seed_id_is_stable_under_key_reordering() {
        let (_dir, corpus, parent_id) = corpus_with_parent();
        let reordered = Seed::from_json_str(
            r#"{
            "b": {"order": 1, "fixed": false, "type": "hex", "value": "0x2"},
            "a": {"order": 0, "fixed": true, "type": "hex", "value": "0x1"}
        }"#,
        )
        .unwrap();
        assert_eq!(corpus.create_seed_id(&reordered), parent_id);
        assert!(parent_id.starts_with("task-0-"));
    }

    #[test]
    fn unchanged_rehash_round_trips_to_the_same_id() {
        let (_dir, corpus, parent_id) = corpus_with_parent();
        let copy = corpus.get(&parent_id).unwrap().seed.clone();
        assert_eq!(corpus.create_seed_id(&copy), parent_id);
    }

    #[test]
    fn mutated_seed_inserts_fresh_record() {
        let (_dir, mut corpus, parent_id) = corpus_with_parent();
        corpus.add(&parent_id, seed_with_b("0x3"), 120, &PcMap::new(), &PcMap::new());
        assert_eq!(corpus.len(), 2);
        let new_id = corpus
            .seeds
            .keys()
            .find(|id| *id != &parent_id)
            .unwrap()
            .clone();
        let record = corpus.get(&new_id).unwrap();
        assert_eq!(record.total_tested_count, 1);
        assert_eq!(record.elapsed_us, 120);
        assert_eq!(record.coverage_hash, None);
    }

    #[test]
    fn identical_seed_and_coverage_counts_as_retest() {
        let (_dir, mut corpus, parent_id) = corpus_with_parent();
        let before = corpus.get(&parent_id).unwrap().total_tested_count;
        corpus.add(&parent_id, seed_with_b("0x2"), 99, &PcMap::new(), &PcMap::new());
        assert_eq!(corpus.len(), 1);
        let parent = corpus.get(&parent_id).unwrap();
        assert_eq!(parent.total_tested_count, before + 1);
        assert_eq!(parent.elapsed_us, 99);
    }

    #[test]
    fn same_seed_with_different_coverage_replaces_the_record() {
        let (_dir, mut corpus, parent_id) = corpus_with_parent();
        corpus.update(&parent_id, 10);
        let kernel: PcMap = [(0x1000, 1)].into_iter().collect();

        // The content hash is the id, so the fresh record lands on the
        // parent's slot with reset bookkeeping.
        corpus.add(&parent_id, seed_with_b("0x2"), 10, &kernel, &PcMap::new());
        assert_eq!(corpus.len(), 1);
        let record = corpus.get(&parent_id).unwrap();
        assert_eq!(record.total_tested_count, 1);
        assert_eq!(record.traced_pcs_a.get(&0x1000), Some(&1));
        assert_eq!(record.total_trace_length, 1);
    }

    #[test]
    fn new_record_clamps_elapsed_to_one() {
        let (_dir, mut corpus, parent_id) = corpus_with_parent();
        corpus.add(&parent_id, seed_with_b("0x5"), 0, &PcMap::new(), &PcMap::new());
        let new_record = corpus
            .seeds
            .values()
            .find(|record| record.id != parent_id)
            .unwrap();
        assert_eq!(new_record.elapsed_us, 1);
    }

    #[test]
    fn update_sets_elapsed_only_once() {
        let (_dir, mut corpus, parent_id) = corpus_with_parent();
        corpus.update(&parent_id, 50);
        corpus.update(&parent_id, 70);
        let record = corpus.get(&parent_id).unwrap();
        assert_eq!(record.elapsed_us, 50);
        assert_eq!(record.total_tested_count, 2);
    }

    #[test]
    fn update_hash_sets_both_fields() {
        let (_dir, mut corpus, parent_id) = corpus_with_parent();
        corpus.update_hash(&parent_id, "fingerprint", 3);
        let record = corpus.get(&parent_id).unwrap();
        assert_eq!(record.coverage_hash.as_deref(), Some("fingerprint"));
        assert_eq!(record.total_same_coverage_seed_count, 3);
    }

    #[test]
    fn pick_random_counts_the_selection() {
        let (_dir, mut corpus, parent_id) = corpus_with_parent();
        let mut rng = Isaac64Rng::seed_from_u64(1);
        let picked = corpus.pick_random(&mut rng).unwrap();
        assert_eq!(picked, parent_id);
        assert_eq!(corpus.get(&parent_id).unwrap().total_tested_count, 1);
    }
}
