//! On-disk weight resolution for quantized models.
//!
//! A model path is either a single weight file or a directory holding a
//! split family `<base>-NNNNN-of-MMMMM.<ext>` (zero-padded, five digits).
//! Split sets must be complete; the engine is pointed at part 1 and loads
//! the remainder itself.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extensions recognized as weight files.
const WEIGHT_EXTENSIONS: &[&str] = &["gguf", "ggml", "bin"];

#[derive(Error, Debug)]
pub enum WeightsError {
    #[error("Weight path does not exist: {0}")]
    NotFound(PathBuf),
    #[error("No weight files found under: {0}")]
    NoWeightFiles(PathBuf),
    #[error("Split set is incomplete, missing: {}", missing.join(", "))]
    IncompleteSplitSet { missing: Vec<String> },
    #[error("I/O error reading weight directory: {0}")]
    Io(#[from] std::io::Error),
}

/// The outcome of resolving a model path to something an engine can load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedWeights {
    /// A single standalone weight file.
    Single(PathBuf),
    /// Part 1 of a complete split family of `total` files.
    SplitFamily { first: PathBuf, total: u32 },
}

impl ResolvedWeights {
    /// The file the engine command line points at.
    pub fn entry_path(&self) -> &Path {
        match self {
            ResolvedWeights::Single(p) => p,
            ResolvedWeights::SplitFamily { first, .. } => first,
        }
    }
}

/// A parsed `<base>-NNNNN-of-MMMMM.<ext>` file name.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SplitName {
    base: String,
    index: u32,
    total: u32,
    ext: String,
}

impl SplitName {
    fn file_name(&self, index: u32) -> String {
        format!(
            "{}-{:05}-of-{:05}.{}",
            self.base, index, self.total, self.ext
        )
    }
}

/// Parse a split-family member name. Returns `None` for anything that does
/// not match the exact zero-padded five-digit pattern.
fn parse_split_name(file_name: &str) -> Option<SplitName> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if !WEIGHT_EXTENSIONS.contains(&ext) {
        return None;
    }

    // stem must end with "-NNNNN-of-MMMMM"
    let (rest, total_str) = stem.rsplit_once("-of-")?;
    if total_str.len() != 5 || !total_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (base, index_str) = rest.rsplit_once('-')?;
    if index_str.len() != 5 || !index_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let index: u32 = index_str.parse().ok()?;
    let total: u32 = total_str.parse().ok()?;
    if base.is_empty() || index == 0 || total == 0 || index > total {
        return None;
    }

    Some(SplitName {
        base: base.to_string(),
        index,
        total,
        ext: ext.to_string(),
    })
}

fn is_weight_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| WEIGHT_EXTENSIONS.contains(&e))
        .unwrap_or(false)
}

/// Resolve a configured local path to a loadable weight entry point.
pub fn resolve_weights(path: &Path) -> Result<ResolvedWeights, WeightsError> {
    if !path.exists() {
        return Err(WeightsError::NotFound(path.to_path_buf()));
    }
    if path.is_file() {
        return Ok(ResolvedWeights::Single(path.to_path_buf()));
    }

    let mut split_members: Vec<SplitName> = Vec::new();
    let mut standalone: Vec<PathBuf> = Vec::new();

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let entry_path = entry.path();
        if !entry_path.is_file() {
            continue;
        }
        let Some(name) = entry_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(split) = parse_split_name(name) {
            split_members.push(split);
        } else if is_weight_file(&entry_path) {
            standalone.push(entry_path);
        }
    }

    if let Some(family) = split_members.first().cloned() {
        if !standalone.is_empty() {
            tracing::info!(
                dir = %path.display(),
                "Directory holds both split parts and merged artifacts, preferring splits"
            );
        }

        let mut missing = Vec::new();
        for index in 1..=family.total {
            let expected = family.file_name(index);
            let present = split_members
                .iter()
                .any(|m| m.base == family.base && m.ext == family.ext && m.index == index);
            if !present && !path.join(&expected).is_file() {
                missing.push(expected);
            }
        }
        if !missing.is_empty() {
            return Err(WeightsError::IncompleteSplitSet { missing });
        }

        return Ok(ResolvedWeights::SplitFamily {
            first: path.join(family.file_name(1)),
            total: family.total,
        });
    }

    standalone.sort();
    match standalone.into_iter().next() {
        Some(file) => Ok(ResolvedWeights::Single(file)),
        None => Err(WeightsError::NoWeightFiles(path.to_path_buf())),
    }
}
