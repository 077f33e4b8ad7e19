//! Saved importance-matrix format
//!
//! # Binary Layout
//!
//! All integers are little-endian `i32`, values little-endian `f32`. There
//! is no magic or version field.
//!
//! ```text
//! entry_count
//! repeat entry_count:
//!     name_len, name bytes
//!     ncall
//!     value_count, value_count x f32
//! last_call
//! prompt_name_len, prompt_name bytes
//! ```
//!
//! A stored value is the cell mean re-weighted by the record's call count,
//! `(sum_sq / count) * ncall`. Loading adds the stored totals to the sums
//! and `ncall` to every count, so loading several files pools their means
//! weighted by how many calls produced each one.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{ImatrixError, Result, StatsStore};

/// Fraction of a routed record's experts that may be patched in.
pub const PATCHABLE_EXPERT_FRACTION: f64 = 0.05;

/// Record that passed the completeness filter, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct CuratedEntry {
    /// Canonical tensor name
    pub name: String,
    /// Collection events behind this record
    pub ncall: u32,
    /// Call-weighted cell means
    pub values: Vec<f32>,
    /// Experts written with the count=1, value=1 placeholder
    pub patched_experts: Vec<usize>,
}

/// Fields written after the entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trailer {
    /// High-water call count of the collector
    pub last_call: u32,
    /// Calibration text the matrix was computed from
    pub prompt_name: String,
}

/// Entry as read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedEntry {
    /// Canonical tensor name
    pub name: String,
    /// Collection events behind this entry
    pub ncall: u32,
    /// Call-weighted cell means
    pub values: Vec<f32>,
}

/// Parsed file contents.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedMatrix {
    /// Entries in file order
    pub entries: Vec<SavedEntry>,
    /// Trailer, absent in files cut short after the last entry
    pub trailer: Option<Trailer>,
}

/// Outcome of a save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveSummary {
    /// Written file
    pub path: PathBuf,
    /// Records written
    pub stored: usize,
    /// Records in the store
    pub total: usize,
}

/// Outcome of a merge-load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    /// Source file
    pub path: PathBuf,
    /// Entries merged
    pub entries: usize,
    /// Trailer of the source file, if present
    pub trailer: Option<Trailer>,
}

/// Apply the completeness filter and the save transform.
///
/// Records without any counted cell are dropped. A partially covered
/// routed record is kept when no more than 5% of its n_as experts are
/// entirely uncovered; those experts are written as count=1, value=1.
/// Partially covered non-routed records are dropped. Output is sorted by
/// name and the store itself is left untouched.
pub fn curate(store: &StatsStore) -> Vec<CuratedEntry> {
    let mut entries = Vec::with_capacity(store.len());

    for name in store.sorted_names() {
        let Some(stats) = store.get(name) else {
            continue;
        };
        let n_all = stats.counts().len();
        if n_all == 0 {
            continue;
        }

        let n_zeros = stats.zero_count_cells();
        if n_zeros == n_all {
            warn!("entry '{}' has no data - skipping", name);
            continue;
        }

        let mut patched_experts = Vec::new();
        if n_zeros > 0 {
            let coverage = 100.0 * (n_all - n_zeros) as f32 / n_all as f32;
            if stats.n_as() <= 1 {
                warn!("entry '{}' has partial data ({:.2}%) - skipping", name, coverage);
                continue;
            }

            let uncovered = stats.uncovered_experts();
            let quota = stats.n_as() as f64 * PATCHABLE_EXPERT_FRACTION;
            if uncovered.len() as f64 > quota {
                warn!(
                    "entry '{}' has partial data ({:.2}%), {} out of {} experts are missing data - skipping",
                    name,
                    coverage,
                    uncovered.len(),
                    stats.n_as()
                );
                continue;
            }
            warn!(
                "entry '{}' has partial data ({:.2}%), {} out of {} experts are missing data - storing but be aware",
                name,
                coverage,
                uncovered.len(),
                stats.n_as()
            );
            patched_experts = uncovered;
        }

        let per_expert = (n_all / stats.n_as().max(1)).max(1);
        let ncall = stats.ncall() as f32;
        let values = stats
            .values()
            .iter()
            .zip(stats.counts())
            .enumerate()
            .map(|(i, (&sum, &count))| {
                if patched_experts.contains(&(i / per_expert)) {
                    ncall
                } else if count == 0 {
                    0.0
                } else {
                    (sum / count as f32) * ncall
                }
            })
            .collect();

        entries.push(CuratedEntry {
            name: name.to_string(),
            ncall: stats.ncall(),
            values,
            patched_experts,
        });
    }

    entries
}

/// Write curated entries and the trailer.
pub fn write_to<W: Write>(writer: &mut W, entries: &[CuratedEntry], trailer: &Trailer) -> Result<()> {
    write_i32(writer, entries.len(), "entry count")?;
    for entry in entries {
        write_bytes(writer, entry.name.as_bytes(), "name length")?;
        write_i32(writer, entry.ncall as usize, "ncall")?;
        write_i32(writer, entry.values.len(), "value count")?;
        for value in &entry.values {
            writer.write_all(&value.to_le_bytes())?;
        }
    }
    write_i32(writer, trailer.last_call as usize, "last call")?;
    write_bytes(writer, trailer.prompt_name.as_bytes(), "prompt name length")?;
    Ok(())
}

/// Curate `store` and write it to `path`, replacing any existing file.
pub fn save(store: &StatsStore, path: impl AsRef<Path>, trailer: &Trailer) -> Result<SaveSummary> {
    let path = path.as_ref();
    let entries = curate(store);
    if entries.len() < store.len() {
        warn!(
            "storing only {} out of {} entries",
            entries.len(),
            store.len()
        );
    }

    let tmp = tmp_path(path);
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        write_to(&mut writer, &entries, trailer)?;
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;

    debug!("Persisted {} entries to {}", entries.len(), path.display());
    Ok(SaveSummary {
        path: path.to_path_buf(),
        stored: entries.len(),
        total: store.len(),
    })
}

/// Parse a saved matrix. `path` only labels errors.
pub fn read_from<R: Read>(reader: &mut R, path: &Path) -> Result<SavedMatrix> {
    let n_entries =
        read_i32(reader).map_err(|e| ImatrixError::format(path, format!("no header: {}", e)))?;
    if n_entries < 1 {
        return Err(ImatrixError::EmptyFile(path.to_path_buf()));
    }

    let mut entries = Vec::with_capacity((n_entries as usize).min(4096));
    for i in 0..n_entries {
        let fail = |what: &str, e: std::io::Error| {
            ImatrixError::format(path, format!("{} for entry {}: {}", what, i + 1, e))
        };

        let len = read_len(reader).map_err(|e| fail("name length", e))?;
        let name = read_exact_vec(reader, len).map_err(|e| fail("name", e))?;
        let name = String::from_utf8(name).map_err(|e| {
            ImatrixError::format(path, format!("name for entry {} is not UTF-8: {}", i + 1, e))
        })?;

        let ncall = read_len(reader).map_err(|e| fail("ncall", e))?;
        let nval = read_len(reader).map_err(|e| fail("number of values", e))?;
        if nval < 1 {
            return Err(ImatrixError::format(
                path,
                format!("entry {} ({}) has no values", i + 1, name),
            ));
        }

        let raw = read_exact_vec(reader, nval * 4).map_err(|e| fail("data", e))?;
        let values = raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        entries.push(SavedEntry {
            name,
            ncall: ncall as u32,
            values,
        });
    }

    let trailer = read_trailer(reader).ok();
    Ok(SavedMatrix { entries, trailer })
}

/// Merge the file at `path` into `store`.
///
/// The whole file is parsed and checked before anything is merged: on error
/// the store is exactly as it was before the call.
pub fn load_into(store: &mut StatsStore, path: impl AsRef<Path>) -> Result<LoadSummary> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| ImatrixError::format(path, format!("failed to open: {}", e)))?;
    let matrix = read_from(&mut BufReader::new(file), path)?;

    let mut widths: HashMap<&str, usize> = HashMap::new();
    for entry in &matrix.entries {
        let expected = widths
            .get(entry.name.as_str())
            .copied()
            .or_else(|| store.get(&entry.name).map(|s| s.len()));
        if let Some(expected) = expected {
            if expected != entry.values.len() {
                return Err(ImatrixError::format(
                    path,
                    format!(
                        "inconsistent size for {} ({} vs {})",
                        entry.name,
                        expected,
                        entry.values.len()
                    ),
                ));
            }
        }
        widths.insert(&entry.name, entry.values.len());
    }

    let n_entries = matrix.entries.len();
    for entry in matrix.entries {
        let stats = store.get_or_insert(&entry.name, entry.values.len());
        for ((sum, count), value) in stats
            .values
            .iter_mut()
            .zip(stats.counts.iter_mut())
            .zip(&entry.values)
        {
            *sum += value;
            *count = count.saturating_add(entry.ncall);
        }
        stats.ncall = stats.ncall.saturating_add(entry.ncall);
    }

    debug!("Merged {} entries from {}", n_entries, path.display());
    Ok(LoadSummary {
        path: path.to_path_buf(),
        entries: n_entries,
        trailer: matrix.trailer,
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_i32<W: Write>(writer: &mut W, value: usize, what: &str) -> Result<()> {
    let value = i32::try_from(value)
        .map_err(|_| ImatrixError::InvalidInput(format!("{} {} does not fit in i32", what, value)))?;
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_bytes<W: Write>(writer: &mut W, bytes: &[u8], what: &str) -> Result<()> {
    write_i32(writer, bytes.len(), what)?;
    writer.write_all(bytes)?;
    Ok(())
}

fn read_i32<R: Read>(reader: &mut R) -> std::io::Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

/// Read a non-negative `i32` length or count.
fn read_len<R: Read>(reader: &mut R) -> std::io::Result<usize> {
    let value = read_i32(reader)?;
    usize::try_from(value).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("negative value {}", value),
        )
    })
}

/// Read exactly `len` bytes without trusting `len` for the allocation.
fn read_exact_vec<R: Read>(reader: &mut R, len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("expected {} bytes, got {}", len, buf.len()),
        ));
    }
    Ok(buf)
}

fn read_trailer<R: Read>(reader: &mut R) -> std::io::Result<Trailer> {
    let last_call = read_len(reader)? as u32;
    let len = read_len(reader)?;
    let prompt_name = read_exact_vec(reader, len)?;
    Ok(Trailer {
        last_call,
        prompt_name: String::from_utf8_lossy(&prompt_name).into_owned(),
    })
}
