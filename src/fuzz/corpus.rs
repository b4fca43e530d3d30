//! Corpus decoding and the on-disk files that tie a harness to its Reader.
//!
//! Every harness `<h>.py` has a `<h>.bindings.json` sidecar holding its
//! consumption steps. After a campaign the retained raw inputs in the corpus
//! directory are decoded with the Reader and written to `<h>.json` as one
//! array of value mappings.

use super::{ConstantBinding, CorpusEntry, Reader};
use crate::persist::{read_json, write_json};
use std::io;
use std::path::{Path, PathBuf};

const BINDINGS_SUFFIX: &str = ".bindings.json";

/// Sidecar path for a harness file: `dir/h.py` ⇒ `dir/h.bindings.json`.
pub fn bindings_path(harness: &Path) -> PathBuf {
    let stem = harness
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    harness.with_file_name(format!("{}{}", stem, BINDINGS_SUFFIX))
}

/// Decoded corpus file for a harness inside a results directory:
/// `<results>/<h>/<h>.json`.
pub fn corpus_file(results_dir: &Path, harness_stem: &str) -> PathBuf {
    results_dir
        .join(harness_stem)
        .join(format!("{}.json", harness_stem))
}

/// Raw input directory the fuzzer writes retained inputs to.
pub fn raw_corpus_dir(results_dir: &Path, harness_stem: &str) -> PathBuf {
    results_dir.join(harness_stem).join("corpus")
}

pub fn write_bindings(harness: &Path, steps: &[ConstantBinding]) -> io::Result<()> {
    write_json(&bindings_path(harness), steps)
}

/// Rebuild the Reader for a harness from its sidecar.
pub fn load_reader(harness: &Path) -> io::Result<Reader> {
    let steps: Vec<ConstantBinding> = read_json(&bindings_path(harness))?;
    Ok(Reader::new(steps))
}

/// Decode every regular file in `dir`, in file-name order.
///
/// A missing directory is an empty corpus.
pub fn decode_dir(reader: &Reader, dir: &Path) -> io::Result<Vec<CorpusEntry>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    files
        .iter()
        .map(|path| std::fs::read(path).map(|data| reader.read(&data)))
        .collect()
}

pub fn write_corpus(path: &Path, entries: &[CorpusEntry]) -> io::Result<()> {
    write_json(path, entries)
}

/// Read a decoded corpus; a missing file is an empty corpus.
pub fn read_corpus(path: &Path) -> io::Result<Vec<CorpusEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    read_json(path)
}
