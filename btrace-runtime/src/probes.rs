// Attach-point concretisation and probe attachment.
//
// Wildcards reach this module as source text; they are expanded against
// the kernel's function and tracepoint listings before anything is
// attached.

use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};

use btrace_ast::AttachPoint;

use crate::elf;
use crate::kernel::{self, Fd, PerfEventAttr};
use crate::RuntimeError;

const TRACEFS: &str = "/sys/kernel/debug/tracing";

/// A concrete attach location bound to its code section.
#[derive(Debug, Clone)]
pub struct ResolvedAttach {
    pub provider: String,
    pub target: String,
    pub func: String,
    pub freq: u64,
    /// Section of the probe function this location runs, named after the
    /// attach point as written in source (wildcards included).
    pub section: String,
}

impl ResolvedAttach {
    pub fn display_name(&self) -> String {
        match self.provider.as_str() {
            "BEGIN" | "END" => self.provider.clone(),
            "kprobe" | "kretprobe" => format!("{}:{}", self.provider, self.func),
            "profile" => format!("{}:{}:{}", self.provider, self.target, self.freq),
            _ => format!("{}:{}:{}", self.provider, self.target, self.func),
        }
    }

    pub fn prog_type(&self) -> u32 {
        match self.provider.as_str() {
            "tracepoint" => kernel::BPF_PROG_TYPE_TRACEPOINT,
            "profile" => kernel::BPF_PROG_TYPE_PERF_EVENT,
            _ => kernel::BPF_PROG_TYPE_KPROBE,
        }
    }
}

/// Expand wildcards and character classes against the live kernel.
pub fn expand(attach_points: &[AttachPoint]) -> Result<Vec<ResolvedAttach>, RuntimeError> {
    let mut resolved = Vec::new();
    for ap in attach_points {
        let section = format!("s_{}", ap.name());
        let make = |func: String| ResolvedAttach {
            provider: ap.provider.clone(),
            target: ap.target.clone(),
            func,
            freq: ap.freq,
            section: section.clone(),
        };

        let pattern_field = match ap.provider.as_str() {
            "kprobe" | "kretprobe" => &ap.func,
            "tracepoint" => &ap.func,
            _ => {
                resolved.push(make(ap.func.clone()));
                continue;
            }
        };

        if !is_pattern(pattern_field) {
            resolved.push(make(ap.func.clone()));
            continue;
        }

        let names = match ap.provider.as_str() {
            "kprobe" | "kretprobe" => kernel_functions()?,
            _ => tracepoint_names(&ap.target)?,
        };
        let matches: Vec<ResolvedAttach> = names
            .into_iter()
            .filter(|name| glob_match(pattern_field, name))
            .map(make)
            .collect();
        if matches.is_empty() {
            return Err(RuntimeError::NoMatches {
                pattern: ap.name(),
            });
        }
        log::info!("{} expands to {} probe(s)", ap.name(), matches.len());
        resolved.extend(matches);
    }
    Ok(resolved)
}

fn is_pattern(s: &str) -> bool {
    s.contains('*') || s.contains('[')
}

fn kernel_functions() -> Result<Vec<String>, RuntimeError> {
    let path = Path::new(TRACEFS).join("available_filter_functions");
    let text = fs::read_to_string(&path).map_err(|source| RuntimeError::Tracefs {
        path: path.clone(),
        source,
    })?;
    Ok(text
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(|s| s.to_string())
        .collect())
}

fn tracepoint_names(target: &str) -> Result<Vec<String>, RuntimeError> {
    let path = Path::new(TRACEFS).join("events").join(target);
    let entries = fs::read_dir(&path).map_err(|source| RuntimeError::Tracefs {
        path: path.clone(),
        source,
    })?;
    Ok(entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect())
}

/// Wildcard match supporting `*` and `[...]` character classes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_inner(&p, &t)
}

fn glob_inner(p: &[char], t: &[char]) -> bool {
    match p.first() {
        None => t.is_empty(),
        Some('*') => {
            // Greedily shrink the tail the star swallows.
            (0..=t.len()).any(|skip| glob_inner(&p[1..], &t[skip..]))
        }
        Some('[') => {
            let close = match p.iter().position(|&c| c == ']') {
                Some(i) if i > 1 => i,
                // An unclosed bracket matches itself literally.
                _ => return literal(p, t, '['),
            };
            match t.first() {
                Some(&c) if p[1..close].contains(&c) => glob_inner(&p[close + 1..], &t[1..]),
                _ => false,
            }
        }
        Some(&ch) => literal(p, t, ch),
    }
}

fn literal(p: &[char], t: &[char], ch: char) -> bool {
    match t.first() {
        Some(&c) if c == ch => glob_inner(&p[1..], &t[1..]),
        _ => false,
    }
}

/// A live probe: its perf event fds (one per CPU for profile probes) are
/// disabled and closed on drop, detaching cleanly on every exit path.
#[derive(Debug)]
pub struct AttachedProbe {
    pub name: String,
    fds: Vec<Fd>,
}

impl Drop for AttachedProbe {
    fn drop(&mut self) {
        for fd in &self.fds {
            let _ = kernel::ioctl(fd, kernel::PERF_EVENT_IOC_DISABLE, 0);
        }
    }
}

/// Attach a loaded program to its concrete location.
pub fn attach(resolved: &ResolvedAttach, prog: &Fd) -> Result<AttachedProbe, RuntimeError> {
    let name = resolved.display_name();
    let fds = match resolved.provider.as_str() {
        "kprobe" => vec![attach_kprobe(&resolved.func, false, prog, &name)?],
        "kretprobe" => vec![attach_kprobe(&resolved.func, true, prog, &name)?],
        "uprobe" => vec![attach_uprobe(resolved, false, prog, &name)?],
        "uretprobe" => vec![attach_uprobe(resolved, true, prog, &name)?],
        "tracepoint" => vec![attach_tracepoint(resolved, prog, &name)?],
        "profile" => attach_profile(resolved, prog, &name)?,
        other => panic!("provider {} reached attach", other),
    };
    Ok(AttachedProbe { name, fds })
}

fn attach_error(name: &str, source: std::io::Error) -> RuntimeError {
    RuntimeError::Attach {
        name: name.to_string(),
        source,
    }
}

fn pmu_type(device: &str, name: &str) -> Result<u32, RuntimeError> {
    let path = format!("/sys/bus/event_source/devices/{}/type", device);
    let text = fs::read_to_string(&path).map_err(|source| RuntimeError::Tracefs {
        path: PathBuf::from(path),
        source,
    })?;
    text.trim()
        .parse()
        .map_err(|_| attach_error(name, std::io::Error::other("bad PMU type")))
}

fn enable(fd: &Fd, prog: &Fd, name: &str) -> Result<(), RuntimeError> {
    kernel::ioctl(fd, kernel::PERF_EVENT_IOC_SET_BPF, prog.raw() as u64)
        .map_err(|e| attach_error(name, e))?;
    kernel::ioctl(fd, kernel::PERF_EVENT_IOC_ENABLE, 0).map_err(|e| attach_error(name, e))
}

fn attach_kprobe(func: &str, retprobe: bool, prog: &Fd, name: &str) -> Result<Fd, RuntimeError> {
    let pmu = pmu_type("kprobe", name)?;
    let func_c = CString::new(func).map_err(|_| {
        attach_error(name, std::io::Error::other("function name contains NUL"))
    })?;

    let mut attr = PerfEventAttr::new(pmu, retprobe as u64);
    attr.flags = kernel::PERF_FLAG_DISABLED;
    attr.config1 = func_c.as_ptr() as u64;
    attr.config2 = 0;

    let fd = kernel::perf_event_open(&attr, -1, 0, -1).map_err(|e| attach_error(name, e))?;
    enable(&fd, prog, name)?;
    Ok(fd)
}

fn attach_uprobe(
    resolved: &ResolvedAttach,
    retprobe: bool,
    prog: &Fd,
    name: &str,
) -> Result<Fd, RuntimeError> {
    let pmu = pmu_type("uprobe", name)?;
    let offset = elf::symbol_file_offset(Path::new(&resolved.target), &resolved.func)
        .map_err(|e| attach_error(name, e))?;
    let path_c = CString::new(resolved.target.as_str())
        .map_err(|_| attach_error(name, std::io::Error::other("path contains NUL")))?;

    let mut attr = PerfEventAttr::new(pmu, retprobe as u64);
    attr.flags = kernel::PERF_FLAG_DISABLED;
    attr.config1 = path_c.as_ptr() as u64;
    attr.config2 = offset;

    let fd = kernel::perf_event_open(&attr, -1, 0, -1).map_err(|e| attach_error(name, e))?;
    enable(&fd, prog, name)?;
    Ok(fd)
}

fn attach_tracepoint(
    resolved: &ResolvedAttach,
    prog: &Fd,
    name: &str,
) -> Result<Fd, RuntimeError> {
    let path = Path::new(TRACEFS)
        .join("events")
        .join(&resolved.target)
        .join(&resolved.func)
        .join("id");
    let text = fs::read_to_string(&path).map_err(|source| RuntimeError::Tracefs {
        path: path.clone(),
        source,
    })?;
    let id: u64 = text
        .trim()
        .parse()
        .map_err(|_| attach_error(name, std::io::Error::other("bad tracepoint id")))?;

    let mut attr = PerfEventAttr::new(kernel::PERF_TYPE_TRACEPOINT, id);
    attr.flags = kernel::PERF_FLAG_DISABLED;

    let fd = kernel::perf_event_open(&attr, -1, 0, -1).map_err(|e| attach_error(name, e))?;
    enable(&fd, prog, name)?;
    Ok(fd)
}

/// One CPU-clock event per CPU. `profile:hz:99` samples at a frequency;
/// `s`/`ms`/`us` units fix the period.
fn attach_profile(
    resolved: &ResolvedAttach,
    prog: &Fd,
    name: &str,
) -> Result<Vec<Fd>, RuntimeError> {
    let mut attr = PerfEventAttr::new(kernel::PERF_TYPE_SOFTWARE, kernel::PERF_COUNT_SW_CPU_CLOCK);
    attr.flags = kernel::PERF_FLAG_DISABLED;
    match resolved.target.as_str() {
        "hz" => {
            attr.flags |= kernel::PERF_FLAG_FREQ;
            attr.sample = resolved.freq;
        }
        "s" => attr.sample = resolved.freq * 1_000_000_000,
        "ms" => attr.sample = resolved.freq * 1_000_000,
        "us" => attr.sample = resolved.freq * 1_000,
        unit => {
            return Err(attach_error(
                name,
                std::io::Error::other(format!("unknown profile unit {}", unit)),
            ))
        }
    }

    let mut fds = Vec::new();
    for cpu in 0..num_cpus::get() {
        let fd = kernel::perf_event_open(&attr, -1, cpu as i32, -1)
            .map_err(|e| attach_error(name, e))?;
        enable(&fd, prog, name)?;
        fds.push(fd);
    }
    Ok(fds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_patterns() {
        assert!(glob_match("sys_*", "sys_open"));
        assert!(glob_match("*blah", "foo_blah"));
        assert!(glob_match("sys*blah", "sys_foo_blah"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("sys_*", "vfs_read"));
        assert!(glob_match("sys_open", "sys_open"));
        assert!(!glob_match("sys_open", "sys_openat"));
    }

    #[test]
    fn glob_character_classes() {
        assert!(glob_match("[Ss]y[Ss]_read", "sys_read"));
        assert!(glob_match("[Ss]y[Ss]_read", "SyS_read"));
        assert!(!glob_match("[Ss]y[Ss]_read", "tys_read"));
        assert!(glob_match("sys_[rw]*", "sys_read"));
        assert!(glob_match("sys_[rw]*", "sys_write"));
        assert!(!glob_match("sys_[rw]*", "sys_open"));
    }

    #[test]
    fn resolved_attach_names() {
        let ra = ResolvedAttach {
            provider: "kprobe".into(),
            target: String::new(),
            func: "sys_open".into(),
            freq: 0,
            section: "s_kprobe:sys_*".into(),
        };
        assert_eq!(ra.display_name(), "kprobe:sys_open");
        assert_eq!(ra.prog_type(), kernel::BPF_PROG_TYPE_KPROBE);
    }
}
