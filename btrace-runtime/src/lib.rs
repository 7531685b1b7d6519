// Runtime glue: concretises attach points, creates maps, loads and
// attaches per-probe code sections, drains the printf perf stream, and
// renders maps at exit.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use btrace_ast::Program;
use btrace_compiler::analyser::Analysis;
use btrace_compiler::IrProgram;

pub mod elf;
pub mod kernel;
pub mod maps;
pub mod perf;
pub mod probes;

pub use maps::MapSet;

use kernel::Fd;
use probes::{AttachedProbe, ResolvedAttach};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("cannot attach {name}: {source}")]
    Attach {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("program section {section} rejected by the loader: {detail}")]
    Load { section: String, detail: String },
    #[error("missing code section {0}")]
    MissingSection(String),
    #[error("map @{name}: {source}")]
    Map {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("{path}: {source}")]
    Tracefs {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("perf ring: {0}")]
    Perf(#[source] io::Error),
    #[error("no probes match {pattern}")]
    NoMatches { pattern: String },
}

static TERM: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_sig: libc::c_int) {
    TERM.store(true, Ordering::SeqCst);
}

pub struct Runtime {
    analysis: Analysis,
    maps: MapSet,
    resolved: Vec<ResolvedAttach>,
    sections: BTreeMap<String, Vec<u8>>,
    progs: HashMap<String, Fd>,
    attached: Vec<AttachedProbe>,
}

impl Runtime {
    /// Expand wildcards and take ownership of the compile products. No
    /// kernel state is created here beyond what MapSet already holds.
    pub fn new(
        program: &Program,
        analysis: Analysis,
        ir: &IrProgram,
        maps: MapSet,
    ) -> Result<Self, RuntimeError> {
        let attach_points: Vec<_> = program
            .probes
            .iter()
            .flat_map(|p| p.attach_points.iter().cloned())
            .collect();
        let resolved = probes::expand(&attach_points)?;

        Ok(Runtime {
            analysis,
            maps,
            resolved,
            sections: ir.encode_sections(),
            progs: HashMap::new(),
            attached: Vec::new(),
        })
    }

    pub fn num_probes(&self) -> usize {
        self.resolved.len()
    }

    fn load_section(&mut self, resolved: &ResolvedAttach) -> Result<(), RuntimeError> {
        if self.progs.contains_key(&resolved.section) {
            return Ok(());
        }
        let bytes = self
            .sections
            .get(&resolved.section)
            .ok_or_else(|| RuntimeError::MissingSection(resolved.section.clone()))?;
        let fd = kernel::prog_load(resolved.prog_type(), bytes).map_err(|detail| {
            RuntimeError::Load {
                section: resolved.section.clone(),
                detail,
            }
        })?;
        self.progs.insert(resolved.section.clone(), fd);
        Ok(())
    }

    fn special_prog(&self, provider: &str) -> Option<&Fd> {
        let resolved = self.resolved.iter().find(|r| r.provider == provider)?;
        self.progs.get(&resolved.section)
    }

    /// Load and attach everything, fire BEGIN, drain the perf stream
    /// until interrupted, fire END, then detach.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        let handler = on_interrupt as extern "C" fn(libc::c_int);
        unsafe {
            libc::signal(libc::SIGINT, handler as usize);
        }

        // Load every referenced section first: a verifier rejection must
        // abort before any probe is live.
        let resolved = self.resolved.clone();
        for r in &resolved {
            self.load_section(r)?;
        }

        let mut collector = match (&self.maps.perf_array, self.analysis.printfs.is_empty()) {
            (Some(array), false) => Some(perf::PerfCollector::open(array, &self.analysis.printfs)?),
            _ => None,
        };

        for r in &resolved {
            if r.provider == "BEGIN" || r.provider == "END" {
                continue;
            }
            let prog = &self.progs[&r.section];
            log::info!("attaching {}", r.display_name());
            self.attached.push(probes::attach(r, prog)?);
        }

        if let Some(prog) = self.special_prog("BEGIN") {
            kernel::prog_test_run(prog).map_err(RuntimeError::Perf)?;
        }

        match &mut collector {
            Some(collector) => collector.drain(&TERM)?,
            None => {
                while !TERM.load(Ordering::SeqCst) {
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }
            }
        }

        if let Some(prog) = self.special_prog("END") {
            kernel::prog_test_run(prog).map_err(RuntimeError::Perf)?;
        }

        // Detach before maps print.
        self.attached.clear();
        Ok(())
    }

    pub fn print_maps(&self) -> Result<(), RuntimeError> {
        self.maps.print_all()
    }
}
