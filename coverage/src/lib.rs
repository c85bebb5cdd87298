//! Trace classification against kernel/firmware address regions.
//!
//! Each worker owns one [`Coverage`] instance for the lifetime of its VM.
//! The per-PC hit maps accumulate across tests; a PC counts as *new* the
//! first time this worker observes it inside a filtered region.

use std::collections::BTreeMap;
use std::fmt;
use std::num::ParseIntError;

use itertools::Itertools;
use log::debug;
use sha2::{Digest, Sha256};

pub mod manager;
pub mod region_index;

pub use manager::CoverageManager;
pub use region_index::{AddressRange, RegionIndex};

/// PC to hit-count map.
pub type PcMap = BTreeMap<u64, u64>;

/// A malformed line in a trace file. The caller skips the iteration's
/// coverage update; the worker keeps running.
#[derive(Debug)]
pub struct TraceParseError {
    pub line: String,
    pub source: ParseIntError,
}

impl fmt::Display for TraceParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed trace PC {:?}: {}", self.line, self.source)
    }
}

impl std::error::Error for TraceParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Outcome of analyzing one trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzeResult {
    pub new_kernel: bool,
    pub new_firmware: bool,
    /// SHA-256 over the space-joined `0x…` forms of the classified PCs in
    /// observation order. Order sensitivity is intentional.
    pub fingerprint: String,
}

/// Classifies observed PCs into kernel, firmware and other regions.
#[derive(Debug)]
pub struct Coverage {
    kernel_index: RegionIndex,
    firmware_index: RegionIndex,
    ignore_kernel_cov: bool,
    ignore_firmware_cov: bool,
    kernel_cov: PcMap,
    firmware_cov: PcMap,
    other: PcMap,
}

impl Coverage {
    pub fn new(
        kernel_index: RegionIndex,
        firmware_index: RegionIndex,
        ignore_kernel_cov: bool,
        ignore_firmware_cov: bool,
    ) -> Self {
        Coverage {
            kernel_index,
            firmware_index,
            ignore_kernel_cov,
            ignore_firmware_cov,
            kernel_cov: PcMap::new(),
            firmware_cov: PcMap::new(),
            other: PcMap::new(),
        }
    }

    /// Classifies `pcs` (hex strings, observation order) and returns the
    /// new-coverage flags plus the trace fingerprint.
    ///
    /// A PC already present in a category map bumps its count without
    /// re-consulting the indexes. PCs outside both filters land in the
    /// `other` map and stay out of the fingerprint.
    pub fn analyze<S: AsRef<str>>(&mut self, pcs: &[S]) -> Result<AnalyzeResult, TraceParseError> {
        let mut new_kernel = false;
        let mut new_firmware = false;
        let mut classified: Vec<u64> = Vec::with_capacity(pcs.len());

        for pc_str in pcs {
            let pc_str = pc_str.as_ref().trim();
            let pc = fuzzer_data::parse_hex(pc_str).map_err(|source| TraceParseError {
                line: pc_str.to_string(),
                source,
            })?;

            if let Some(count) = self.kernel_cov.get_mut(&pc) {
                *count += 1;
                classified.push(pc);
                continue;
            }
            if let Some(count) = self.firmware_cov.get_mut(&pc) {
                *count += 1;
                classified.push(pc);
                continue;
            }

            if self.kernel_index.contains(pc) {
                self.kernel_cov.insert(pc, 1);
                new_kernel = true;
                classified.push(pc);
                continue;
            }
            if self.firmware_index.contains(pc) {
                self.firmware_cov.insert(pc, 1);
                new_firmware = true;
                classified.push(pc);
                continue;
            }

            *self.other.entry(pc).or_insert(0) += 1;
        }

        let joined = classified.iter().map(|pc| format!("{pc:#x}")).join(" ");
        let fingerprint = format!("{:x}", Sha256::digest(joined.as_bytes()));

        debug!(
            "analyzed {} PCs ({} classified), kernel new: {}, firmware new: {}",
            pcs.len(),
            classified.len(),
            new_kernel,
            new_firmware
        );

        if self.ignore_kernel_cov {
            new_kernel = false;
        }
        if self.ignore_firmware_cov {
            new_firmware = false;
        }

        Ok(AnalyzeResult {
            new_kernel,
            new_firmware,
            fingerprint,
        })
    }

    /// The accumulated (kernel, firmware) maps.
    pub fn maps(&self) -> (&PcMap, &PcMap) {
        (&self.kernel_cov, &self.firmware_cov)
    }

    pub fn other(&self) -> &PcMap {
        &self.other
    }

    /// Widens the firmware filter at runtime. Targets that locate a
    /// dynamically loaded code region during boot use this.
    pub fn append_firmware_range(&mut self, range: AddressRange) {
        self.firmware_index.append(range);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coverage() -> Coverage {
        Coverage::new(
            RegionIndex::new(vec![AddressRange::new(0x1000, 0x1fff)]),
            RegionIndex::new(vec![AddressRange::new(0x2000, 0x2fff)]),
            false,
            false,
        )
    }

    fn sha256_hex(data: &str) -> String {
        format!("{:x}", Sha256::digest(data.as_bytes()))
    }

    #[test]
    fn classification_and_fingerprint() {
        let mut coverage = coverage();
        let result = coverage
            .analyze(&["0x1000", "0x2000", "0x1000", "0x4000"])
            .unwrap();

        assert!(result.new_kernel);
        assert!(result.new_firmware);
        assert_eq!(result.fingerprint, sha256_hex("0x1000 0x2000 0x1000"));

        let (kernel, firmware) = coverage.maps();
        assert_eq!(kernel.get(&0x1000), Some(&2));
        assert_eq!(firmware.get(&0x2000), Some(&1));
        assert_eq!(coverage.other().get(&0x4000), Some(&1));
    }

    #[test]
    fn every_pc_lands_in_exactly_one_map() {
        let mut coverage = coverage();
        coverage
            .analyze(&["0x1000", "0x1fff", "0x2000", "0x2fff", "0x3000", "0x0"])
            .unwrap();
        let (kernel, firmware) = coverage.maps();
        for pc in kernel.keys() {
            assert!(!firmware.contains_key(pc));
            assert!(!coverage.other().contains_key(pc));
        }
        for pc in firmware.keys() {
            assert!(!coverage.other().contains_key(pc));
        }
        assert_eq!(kernel.len() + firmware.len() + coverage.other().len(), 6);
    }

    #[test]
    fn rehit_is_not_new_coverage() {
        let mut coverage = coverage();
        let first = coverage.analyze(&["0x1000"]).unwrap();
        assert!(first.new_kernel);
        let second = coverage.analyze(&["0x1000"]).unwrap();
        assert!(!second.new_kernel);
        assert_eq!(coverage.maps().0.get(&0x1000), Some(&2));
    }

    #[test]
    fn empty_trace_hashes_empty_string_and_leaves_maps_alone() {
        let mut coverage = coverage();
        let empty: [&str; 0] = [];
        let first = coverage.analyze(&empty).unwrap();
        let second = coverage.analyze(&empty).unwrap();
        assert_eq!(first.fingerprint, sha256_hex(""));
        assert_eq!(first.fingerprint, second.fingerprint);
        assert!(coverage.maps().0.is_empty());
        assert!(coverage.maps().1.is_empty());
        assert!(coverage.other().is_empty());
    }

    #[test]
    fn deterministic_fingerprint() {
        let mut a = coverage();
        let mut b = coverage();
        let trace = ["0x1000", "0x2000", "0x1abc"];
        assert_eq!(
            a.analyze(&trace).unwrap().fingerprint,
            b.analyze(&trace).unwrap().fingerprint
        );
    }

    #[test]
    fn ignore_flags_mask_new_coverage_but_keep_fingerprint() {
        let mut coverage = Coverage::new(
            RegionIndex::new(vec![AddressRange::new(0x1000, 0x1fff)]),
            RegionIndex::new(vec![AddressRange::new(0x2000, 0x2fff)]),
            true,
            true,
        );
        let result = coverage.analyze(&["0x1000", "0x2000"]).unwrap();
        assert!(!result.new_kernel);
        assert!(!result.new_firmware);
        assert_eq!(result.fingerprint, sha256_hex("0x1000 0x2000"));
        assert_eq!(coverage.maps().0.get(&0x1000), Some(&1));
    }

    #[test]
    fn malformed_pc_aborts_analysis() {
        let mut coverage = coverage();
        let err = coverage.analyze(&["0x1000", "bogus!"]).unwrap_err();
        assert_eq!(err.line, "bogus!");
    }

    #[test]
    fn appended_firmware_range_takes_effect() {
        let mut coverage = coverage();
        let miss = coverage.analyze(&["0x8000"]).unwrap();
        assert!(!miss.new_firmware);
        coverage.append_firmware_range(AddressRange::new(0x8000, 0x8fff));
        let hit = coverage.analyze(&["0x8000"]).unwrap();
        assert!(hit.new_firmware);
    }
}
