// Map creation and exit-time rendering.
//
// Rendering is type-directed from the analyser's metadata and kept as
// pure functions over (key bytes, value bytes) pairs so it can be tested
// without a kernel.

use std::collections::BTreeMap;
use std::fs;
use std::io;

use btrace_ast::Kind;
use btrace_compiler::analyser::{Aggregation, Analysis, MapDef, PrintHint};

use crate::kernel::{self, Fd};
use crate::RuntimeError;

const MAX_ENTRIES: u32 = 4096;
const BAR_WIDTH: usize = 40;

#[derive(Debug)]
pub struct MapHandle {
    pub def: MapDef,
    pub fd: Option<Fd>,
}

/// All of a program's maps, plus the perf-event array backing printf.
#[derive(Debug)]
pub struct MapSet {
    pub handles: BTreeMap<String, MapHandle>,
    pub perf_array: Option<Fd>,
}

impl MapSet {
    /// Instantiate the unified map table. With `fake` set (the AST/IR
    /// dump path) the table is built without touching the kernel.
    pub fn create(analysis: &Analysis, fake: bool) -> Result<Self, RuntimeError> {
        let mut handles = BTreeMap::new();
        for def in analysis.maps.values() {
            let fd = if fake {
                None
            } else {
                let fd = kernel::map_create(
                    kernel::BPF_MAP_TYPE_HASH,
                    def.key_size() as u32,
                    def.value_type.size.max(8) as u32,
                    MAX_ENTRIES,
                )
                .map_err(|source| RuntimeError::Map {
                    name: def.name.clone(),
                    source,
                })?;
                Some(fd)
            };
            handles.insert(def.name.clone(), MapHandle { def: def.clone(), fd });
        }

        let perf_array = if !analysis.printfs.is_empty() && !fake {
            let fd = kernel::map_create(
                kernel::BPF_MAP_TYPE_PERF_EVENT_ARRAY,
                4,
                4,
                num_cpus::get() as u32,
            )
            .map_err(|source| RuntimeError::Map {
                name: "__printf".to_string(),
                source,
            })?;
            Some(fd)
        } else {
            None
        };

        log::debug!("created {} map(s)", handles.len());
        Ok(MapSet { handles, perf_array })
    }

    fn entries(&self, handle: &MapHandle) -> io::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let fd = match &handle.fd {
            Some(fd) => fd,
            None => return Ok(Vec::new()),
        };
        let key_size = handle.def.key_size();
        let value_size = handle.def.value_type.size.max(8);

        let mut out = Vec::new();
        let mut key = vec![0u8; key_size];
        let mut have = kernel::map_get_next_key(fd, None, &mut key)?;
        while have {
            let mut value = vec![0u8; value_size];
            if kernel::map_lookup(fd, &key, &mut value)? {
                out.push((key.clone(), value));
            }
            let mut next = vec![0u8; key_size];
            have = kernel::map_get_next_key(fd, Some(&key), &mut next)?;
            key = next;
        }
        Ok(out)
    }

    /// Render every map to stdout.
    pub fn print_all(&self) -> Result<(), RuntimeError> {
        let ksyms = Ksyms::load();
        for handle in self.handles.values() {
            let entries = self.entries(handle).map_err(|source| RuntimeError::Map {
                name: handle.def.name.clone(),
                source,
            })?;
            print!("{}", render_map(&handle.def, &entries, &ksyms));
        }
        Ok(())
    }
}

/// Kernel symbol table for sym()-tagged values.
pub struct Ksyms {
    // (address, name), sorted by address
    syms: Vec<(u64, String)>,
}

impl Ksyms {
    pub fn load() -> Self {
        let mut syms: Vec<(u64, String)> = fs::read_to_string("/proc/kallsyms")
            .unwrap_or_default()
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let addr = u64::from_str_radix(parts.next()?, 16).ok()?;
                let _kind = parts.next()?;
                let name = parts.next()?;
                Some((addr, name.to_string()))
            })
            .collect();
        syms.sort();
        Ksyms { syms }
    }

    pub fn empty() -> Self {
        Ksyms { syms: Vec::new() }
    }

    /// Nearest symbol at or below `addr`.
    pub fn resolve(&self, addr: u64) -> Option<String> {
        let idx = self.syms.partition_point(|(a, _)| *a <= addr);
        let (base, name) = self.syms.get(idx.checked_sub(1)?)?;
        if addr == *base {
            Some(name.clone())
        } else {
            Some(format!("{}+0x{:x}", name, addr - base))
        }
    }
}

fn int_at(bytes: &[u8]) -> i64 {
    let mut word = [0u8; 8];
    let n = bytes.len().min(8);
    word[..n].copy_from_slice(&bytes[..n]);
    i64::from_le_bytes(word)
}

fn trim_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// One key rendered for display; strings unquoted, integers decimal.
fn render_key(def: &MapDef, key: &[u8]) -> String {
    let mut parts = Vec::new();
    let mut offset = 0;
    for ty in &def.key_types {
        match ty.kind {
            Kind::String => {
                let end = (offset + ty.size).min(key.len());
                parts.push(trim_nul(&key[offset..end]));
                offset += ty.size;
            }
            _ => {
                parts.push(int_at(&key[offset.min(key.len())..]).to_string());
                offset += 8;
            }
        }
    }
    parts.join(", ")
}

fn render_value(def: &MapDef, value: &[u8], ksyms: &Ksyms) -> String {
    match def.value_type.kind {
        Kind::String => trim_nul(value),
        _ => {
            let n = int_at(value);
            match def.print_hint {
                PrintHint::KernelSymbol => ksyms
                    .resolve(n as u64)
                    .unwrap_or_else(|| format!("0x{:x}", n)),
                PrintHint::UserSymbol => format!("0x{:x}", n),
                PrintHint::Plain => n.to_string(),
            }
        }
    }
}

/// Render a whole map. Scalar maps print one `@name[key] = value` line
/// per entry; quantize maps print per-bucket histograms.
pub fn render_map(def: &MapDef, entries: &[(Vec<u8>, Vec<u8>)], ksyms: &Ksyms) -> String {
    match def.aggregation {
        Aggregation::Quantize => render_quantize(def, entries),
        _ => render_scalar(def, entries, ksyms),
    }
}

fn render_scalar(def: &MapDef, entries: &[(Vec<u8>, Vec<u8>)], ksyms: &Ksyms) -> String {
    let single_int_key =
        def.key_types.len() == 1 && !def.key_types[0].is_string();

    let mut rows: Vec<(Vec<u8>, String, String)> = entries
        .iter()
        .map(|(k, v)| (k.clone(), render_key(def, k), render_value(def, v, ksyms)))
        .collect();

    if single_int_key {
        rows.sort_by_key(|(k, _, _)| int_at(k));
    } else {
        rows.sort_by(|a, b| a.1.cmp(&b.1));
    }

    let mut out = String::new();
    for (_, key, value) in rows {
        if def.key_types.is_empty() {
            out.push_str(&format!("@{} = {}\n", def.name, value));
        } else {
            out.push_str(&format!("@{}[{}] = {}\n", def.name, key, value));
        }
    }
    out
}

/// Histogram rendering: one `[2^i, 2^(i+1))` line per occupied bucket,
/// bar width proportional to the count.
fn render_quantize(def: &MapDef, entries: &[(Vec<u8>, Vec<u8>)]) -> String {
    // The bucket index is the trailing key slot; everything before it
    // groups the histogram.
    let mut groups: BTreeMap<String, Vec<(i64, i64)>> = BTreeMap::new();
    for (key, value) in entries {
        let split = key.len().saturating_sub(8);
        let bucket = int_at(&key[split..]);
        let prefix = render_key(def, &key[..split]);
        groups.entry(prefix).or_default().push((bucket, int_at(value)));
    }

    let mut out = String::new();
    for (prefix, mut buckets) in groups {
        buckets.sort();
        if def.key_types.is_empty() {
            out.push_str(&format!("@{}:\n", def.name));
        } else {
            out.push_str(&format!("@{}[{}]:\n", def.name, prefix));
        }

        let max = buckets.iter().map(|(_, v)| *v).max().unwrap_or(1).max(1);
        for (bucket, count) in buckets {
            let lo: u128 = 1u128 << bucket.clamp(0, 127);
            let hi: u128 = lo << 1;
            let bar_len = ((count as u128 * BAR_WIDTH as u128) / max as u128) as usize;
            let bar: String = "@".repeat(bar_len.min(BAR_WIDTH));
            out.push_str(&format!(
                "{:<20} {:>8} |{:<width$}|\n",
                format!("[{}, {})", lo, hi),
                count,
                bar,
                width = BAR_WIDTH
            ));
        }
    }
    out
}
