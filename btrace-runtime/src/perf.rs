// Per-CPU perf-event ring buffers carrying printf records from probes to
// the collector, and the printf formatter itself.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use btrace_ast::Kind;
use btrace_compiler::analyser::PrintfSpec;

use crate::kernel::{self, Fd, PerfEventAttr};
use crate::RuntimeError;

/// Data area of each ring, in pages (must be a power of two).
const DATA_PAGES: usize = 8;
const POLL_TIMEOUT_MS: i32 = 100;

#[repr(C)]
struct PerfEventHeader {
    type_: u32,
    misc: u16,
    size: u16,
}

/// Layout mirrors the kernel's `struct perf_event_mmap_page` header fields
/// used here; only the fields this module reads/writes are included.
#[repr(C)]
struct PerfEventMmapPage {
    version: u32,
    compat_version: u32,
    lock: u32,
    index: u32,
    offset: i64,
    time_enabled: u64,
    time_running: u64,
    capabilities: u64,
    pmc_width: u16,
    time_shift: u16,
    time_mult: u32,
    time_offset: u64,
    time_zero: u64,
    size: u32,
    reserved_1: u32,
    time_cycles: u64,
    time_mask: u64,
    reserved: [u8; 928],
    data_head: u64,
    data_tail: u64,
    data_offset: u64,
    data_size: u64,
    aux_head: u64,
    aux_tail: u64,
    aux_offset: u64,
    aux_size: u64,
}

struct PerfReader {
    fd: Fd,
    base: *mut u8,
    len: usize,
    page_size: usize,
}

impl PerfReader {
    fn open(cpu: usize, perf_array: &Fd) -> Result<Self, RuntimeError> {
        let mut attr = PerfEventAttr::new(
            kernel::PERF_TYPE_SOFTWARE,
            kernel::PERF_COUNT_SW_BPF_OUTPUT,
        );
        attr.sample_type = kernel::PERF_SAMPLE_RAW;
        attr.wakeup = 1;

        let fd = kernel::perf_event_open(&attr, -1, cpu as i32, -1)
            .map_err(RuntimeError::Perf)?;

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = page_size * (DATA_PAGES + 1);
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.raw(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RuntimeError::Perf(io::Error::last_os_error()));
        }

        // Route this CPU's probe output into the new ring.
        kernel::map_update(
            perf_array,
            &(cpu as u32).to_le_bytes(),
            &(fd.raw() as u32).to_le_bytes(),
        )
        .map_err(RuntimeError::Perf)?;
        kernel::ioctl(&fd, kernel::PERF_EVENT_IOC_ENABLE, 0).map_err(RuntimeError::Perf)?;

        Ok(PerfReader {
            fd,
            base: base as *mut u8,
            len,
            page_size,
        })
    }

    /// Drain every complete record currently in the ring. Records are
    /// handed to `on_sample` in arrival order for this CPU.
    fn read(&mut self, on_sample: &mut dyn FnMut(&[u8])) {
        let page = self.base as *mut PerfEventMmapPage;
        let data = unsafe { self.base.add(self.page_size) };
        let data_size = (self.len - self.page_size) as u64;

        let head = unsafe { ptr::read_volatile(&(*page).data_head) };
        let mut tail = unsafe { ptr::read_volatile(&(*page).data_tail) };
        std::sync::atomic::fence(Ordering::Acquire);

        while tail < head {
            let offset = (tail % data_size) as usize;
            let header = self.copy_bytes(data, offset, std::mem::size_of::<PerfEventHeader>());
            let (type_, size) = {
                let h = header.as_ptr() as *const PerfEventHeader;
                unsafe { ((*h).type_, (*h).size as usize) }
            };
            if size == 0 {
                break;
            }

            let record = self.copy_bytes(data, offset, size);
            if type_ == kernel::PERF_RECORD_SAMPLE {
                // header, u32 raw size, raw data
                let body = &record[std::mem::size_of::<PerfEventHeader>()..];
                if body.len() >= 4 {
                    let raw_len = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
                    let raw = &body[4..(4 + raw_len).min(body.len())];
                    on_sample(raw);
                }
            } else if type_ == kernel::PERF_RECORD_LOST {
                log::warn!("perf ring dropped records on cpu");
            }
            tail += size as u64;
        }

        std::sync::atomic::fence(Ordering::Release);
        unsafe { ptr::write_volatile(&mut (*page).data_tail, tail) };
    }

    /// Copy out of the ring, following the wrap-around.
    fn copy_bytes(&self, data: *const u8, offset: usize, len: usize) -> Vec<u8> {
        let data_size = self.len - self.page_size;
        let mut out = vec![0u8; len];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = unsafe { *data.add((offset + i) % data_size) };
        }
        out
    }
}

impl Drop for PerfReader {
    fn drop(&mut self) {
        let _ = kernel::ioctl(&self.fd, kernel::PERF_EVENT_IOC_DISABLE, 0);
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// Single-threaded collector over every CPU's ring.
pub struct PerfCollector {
    readers: Vec<PerfReader>,
    printfs: Vec<PrintfSpec>,
}

impl PerfCollector {
    pub fn open(perf_array: &Fd, printfs: &[PrintfSpec]) -> Result<Self, RuntimeError> {
        let mut readers = Vec::new();
        for cpu in 0..num_cpus::get() {
            readers.push(PerfReader::open(cpu, perf_array)?);
        }
        Ok(PerfCollector {
            readers,
            printfs: printfs.to_vec(),
        })
    }

    /// Poll and drain until the termination flag is observed. The flag is
    /// checked between poll iterations, so the current record is always
    /// completed before shutdown.
    pub fn drain(&mut self, term: &AtomicBool) -> Result<(), RuntimeError> {
        let mut pollfds: Vec<libc::pollfd> = self
            .readers
            .iter()
            .map(|r| libc::pollfd {
                fd: r.fd.raw(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let printfs = self.printfs.clone();
        while !term.load(Ordering::SeqCst) {
            let ret = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, POLL_TIMEOUT_MS)
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(RuntimeError::Perf(err));
            }
            if ret == 0 {
                continue;
            }
            sweep(&mut self.readers, &printfs);
            for p in pollfds.iter_mut() {
                p.revents = 0;
            }
        }

        // One final sweep so nothing already in the rings is dropped.
        sweep(&mut self.readers, &printfs);
        Ok(())
    }
}

fn sweep(readers: &mut [PerfReader], printfs: &[PrintfSpec]) {
    for reader in readers.iter_mut() {
        reader.read(&mut |raw| handle_sample(printfs, raw));
    }
}

fn handle_sample(printfs: &[PrintfSpec], raw: &[u8]) {
    if raw.len() < 8 {
        return;
    }
    let id = u64::from_le_bytes([
        raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
    ]) as usize;
    match printfs.get(id) {
        Some(spec) => print!("{}", format_record(spec, raw)),
        None => log::warn!("printf record with unknown id {}", id),
    }
}

/// Render one printf record. `record` starts with the 8-byte id; fields
/// follow in the analyser's recorded layout.
pub fn format_record(spec: &PrintfSpec, record: &[u8]) -> String {
    let mut fields: Vec<String> = Vec::new();
    let mut offset = 8;
    for ty in &spec.args {
        match ty.kind {
            Kind::String => {
                let end = (offset + ty.size).min(record.len());
                let bytes = record.get(offset..end).unwrap_or(&[]);
                let nul = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                fields.push(String::from_utf8_lossy(&bytes[..nul]).into_owned());
                offset += ty.size;
            }
            _ => {
                let mut word = [0u8; 8];
                if let Some(bytes) = record.get(offset..offset + 8) {
                    word.copy_from_slice(bytes);
                }
                fields.push(i64::from_le_bytes(word).to_string());
                offset += 8;
            }
        }
    }

    let mut out = String::new();
    let mut args = fields.into_iter();
    let mut chars = spec.fmt.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('d') | Some('u') | Some('s') => {
                out.push_str(&args.next().unwrap_or_default());
            }
            Some('x') => {
                let text = args.next().unwrap_or_default();
                match text.parse::<i64>() {
                    Ok(n) => out.push_str(&format!("{:x}", n)),
                    Err(_) => out.push_str(&text),
                }
            }
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use btrace_ast::SizedType;

    fn spec(fmt: &str, args: Vec<SizedType>) -> PrintfSpec {
        PrintfSpec {
            fmt: fmt.to_string(),
            args,
        }
    }

    fn record(id: u64, fields: &[&[u8]]) -> Vec<u8> {
        let mut out = id.to_le_bytes().to_vec();
        for f in fields {
            out.extend_from_slice(f);
        }
        out
    }

    #[test]
    fn formats_integers_and_strings() {
        let spec = spec(
            "%d opened %s\n",
            vec![SizedType::integer(), SizedType::string(16)],
        );
        let mut name = b"bash".to_vec();
        name.resize(16, 0);
        let rec = record(0, &[&42i64.to_le_bytes(), &name]);
        assert_eq!(format_record(&spec, &rec), "42 opened bash\n");
    }

    #[test]
    fn formats_hex_and_percent_escape() {
        let spec = spec("%x%%\n", vec![SizedType::integer()]);
        let rec = record(0, &[&255i64.to_le_bytes()]);
        assert_eq!(format_record(&spec, &rec), "ff%\n");
    }

    #[test]
    fn surplus_directives_render_empty() {
        let spec = spec("%d %d\n", vec![SizedType::integer()]);
        let rec = record(0, &[&7i64.to_le_bytes()]);
        assert_eq!(format_record(&spec, &rec), "7 \n");
    }

    #[test]
    fn unknown_directives_pass_through() {
        let spec = spec("100%f\n", vec![]);
        let rec = record(0, &[]);
        assert_eq!(format_record(&spec, &rec), "100%f\n");
    }
}
