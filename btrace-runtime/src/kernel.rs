// Thin wrappers over the bpf(2) and perf_event_open(2) syscalls. Every
// unsafe block in the runtime lives here or in the perf ring reader.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;

// bpf(2) commands
const BPF_MAP_CREATE: libc::c_int = 0;
const BPF_MAP_LOOKUP_ELEM: libc::c_int = 1;
const BPF_MAP_UPDATE_ELEM: libc::c_int = 2;
const BPF_MAP_DELETE_ELEM: libc::c_int = 3;
const BPF_MAP_GET_NEXT_KEY: libc::c_int = 4;
const BPF_PROG_LOAD: libc::c_int = 5;
const BPF_PROG_TEST_RUN: libc::c_int = 10;

// map types
pub const BPF_MAP_TYPE_HASH: u32 = 1;
pub const BPF_MAP_TYPE_PERF_EVENT_ARRAY: u32 = 4;

// program types
pub const BPF_PROG_TYPE_KPROBE: u32 = 2;
pub const BPF_PROG_TYPE_TRACEPOINT: u32 = 5;
pub const BPF_PROG_TYPE_PERF_EVENT: u32 = 7;

// perf event types and configs
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;
pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_BPF_OUTPUT: u64 = 10;

// perf_event_attr flag bits
pub const PERF_FLAG_DISABLED: u64 = 1;
pub const PERF_FLAG_FREQ: u64 = 1 << 10;

pub const PERF_SAMPLE_RAW: u64 = 1 << 10;

// perf record types
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_SAMPLE: u32 = 9;

// ioctls
pub const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
pub const PERF_EVENT_IOC_SET_BPF: libc::c_ulong = 0x4004_2408;

/// Owned file descriptor, closed on drop.
#[derive(Debug)]
pub struct Fd(RawFd);

impl Fd {
    pub fn raw(&self) -> RawFd {
        self.0
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// perf_event_attr, laid out to PERF_ATTR_SIZE_VER5.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    /// sample_period or sample_freq, selected by PERF_FLAG_FREQ
    pub sample: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    /// wakeup_events or wakeup_watermark
    pub wakeup: u32,
    pub bp_type: u32,
    /// kprobe_func / uprobe_path / config1
    pub config1: u64,
    /// kprobe_addr / probe_offset / config2
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub reserved_2: u16,
}

impl PerfEventAttr {
    pub fn new(type_: u32, config: u64) -> Self {
        Self {
            type_,
            size: std::mem::size_of::<Self>() as u32,
            config,
            ..Self::default()
        }
    }
}

pub fn perf_event_open(
    attr: &PerfEventAttr,
    pid: i32,
    cpu: i32,
    group_fd: i32,
) -> io::Result<Fd> {
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            group_fd,
            0u64,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Fd(fd as RawFd))
}

pub fn ioctl(fd: &Fd, request: libc::c_ulong, arg: u64) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd.raw(), request as _, arg) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn bpf(cmd: libc::c_int, attr: *mut u8, size: usize) -> libc::c_long {
    unsafe { libc::syscall(libc::SYS_bpf, cmd, attr, size) }
}

#[repr(C)]
#[derive(Default)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
}

pub fn map_create(
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
) -> io::Result<Fd> {
    let mut attr = MapCreateAttr {
        map_type,
        key_size,
        value_size,
        max_entries,
        map_flags: 0,
    };
    let fd = bpf(
        BPF_MAP_CREATE,
        &mut attr as *mut MapCreateAttr as *mut u8,
        std::mem::size_of::<MapCreateAttr>(),
    );
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Fd(fd as RawFd))
}

#[repr(C)]
#[derive(Default)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

fn map_elem_attr(fd: &Fd, key: &[u8], value: u64) -> MapElemAttr {
    MapElemAttr {
        map_fd: fd.raw() as u32,
        _pad: 0,
        key: key.as_ptr() as u64,
        value,
        flags: 0,
    }
}

pub fn map_lookup(fd: &Fd, key: &[u8], value: &mut [u8]) -> io::Result<bool> {
    let mut attr = map_elem_attr(fd, key, value.as_mut_ptr() as u64);
    let ret = bpf(
        BPF_MAP_LOOKUP_ELEM,
        &mut attr as *mut MapElemAttr as *mut u8,
        std::mem::size_of::<MapElemAttr>(),
    );
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(true)
}

pub fn map_update(fd: &Fd, key: &[u8], value: &[u8]) -> io::Result<()> {
    let mut attr = map_elem_attr(fd, key, value.as_ptr() as u64);
    let ret = bpf(
        BPF_MAP_UPDATE_ELEM,
        &mut attr as *mut MapElemAttr as *mut u8,
        std::mem::size_of::<MapElemAttr>(),
    );
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn map_delete(fd: &Fd, key: &[u8]) -> io::Result<()> {
    let mut attr = map_elem_attr(fd, key, 0);
    let ret = bpf(
        BPF_MAP_DELETE_ELEM,
        &mut attr as *mut MapElemAttr as *mut u8,
        std::mem::size_of::<MapElemAttr>(),
    );
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Next key after `key` (None begins iteration); Ok(None) at the end.
pub fn map_get_next_key(fd: &Fd, key: Option<&[u8]>, next: &mut [u8]) -> io::Result<bool> {
    let mut attr = MapElemAttr {
        map_fd: fd.raw() as u32,
        _pad: 0,
        key: key.map(|k| k.as_ptr() as u64).unwrap_or(0),
        value: next.as_mut_ptr() as u64,
        flags: 0,
    };
    let ret = bpf(
        BPF_MAP_GET_NEXT_KEY,
        &mut attr as *mut MapElemAttr as *mut u8,
        std::mem::size_of::<MapElemAttr>(),
    );
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(true)
}

#[repr(C)]
#[derive(Default)]
struct ProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
}

/// Hand one code section to the in-kernel loader. The verifier log is
/// returned on rejection so the error can be surfaced verbatim.
pub fn prog_load(prog_type: u32, section: &[u8]) -> Result<Fd, String> {
    let license = CString::new("GPL").map_err(|e| e.to_string())?;
    let mut log = vec![0u8; 64 * 1024];
    let mut attr = ProgLoadAttr {
        prog_type,
        insn_cnt: (section.len() / 8) as u32,
        insns: section.as_ptr() as u64,
        license: license.as_ptr() as u64,
        log_level: 1,
        log_size: log.len() as u32,
        log_buf: log.as_mut_ptr() as u64,
        kern_version: 0,
    };
    let fd = bpf(
        BPF_PROG_LOAD,
        &mut attr as *mut ProgLoadAttr as *mut u8,
        std::mem::size_of::<ProgLoadAttr>(),
    );
    if fd < 0 {
        let err = io::Error::last_os_error();
        let nul = log.iter().position(|&b| b == 0).unwrap_or(0);
        let text = String::from_utf8_lossy(&log[..nul]).into_owned();
        if text.is_empty() {
            return Err(err.to_string());
        }
        return Err(format!("{}: {}", err, text));
    }
    Ok(Fd(fd as RawFd))
}

#[repr(C)]
#[derive(Default)]
struct ProgTestRunAttr {
    prog_fd: u32,
    retval: u32,
    data_size_in: u32,
    data_size_out: u32,
    data_in: u64,
    data_out: u64,
    repeat: u32,
    duration: u32,
}

/// Fire a loaded program once from user space; used for BEGIN/END.
pub fn prog_test_run(fd: &Fd) -> io::Result<u32> {
    let data = [0u8; 32];
    let mut attr = ProgTestRunAttr {
        prog_fd: fd.raw() as u32,
        data_in: data.as_ptr() as u64,
        data_size_in: data.len() as u32,
        repeat: 1,
        ..ProgTestRunAttr::default()
    };
    let ret = bpf(
        BPF_PROG_TEST_RUN,
        &mut attr as *mut ProgTestRunAttr as *mut u8,
        std::mem::size_of::<ProgTestRunAttr>(),
    );
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(attr.retval)
}
