use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use btrace_ast::Printer;
use btrace_compiler::analyser::{Analyser, Analysis};
use btrace_compiler::{CodeGen, IrProgram};
use btrace_runtime::{MapSet, Runtime};

#[derive(Parser)]
#[command(name = "btrace")]
#[command(version = "0.2.0")]
#[command(about = "High-level tracing language for Linux", long_about = None)]
struct Cli {
    /// Print the AST and the lowered IR, then exit before loading probes
    #[arg(short = 'd')]
    debug: bool,

    /// Script given on the command line
    #[arg(short = 'e', value_name = "SCRIPT")]
    script: Option<String>,

    /// Script file
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    // Exactly one of -e and the file argument.
    let source = match (cli.script, &cli.file) {
        (Some(script), None) => script,
        (None, Some(path)) => match fs::read_to_string(path) {
            Ok(source) => source,
            Err(err) => {
                eprintln!("btrace: {}: {}", path.display(), err);
                return ExitCode::from(1);
            }
        },
        _ => {
            eprintln!("Usage:");
            eprintln!("  btrace [-d] filename");
            eprintln!("  btrace [-d] -e 'script'");
            return ExitCode::from(1);
        }
    };

    match run(&source, cli.debug) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("btrace: {:#}", err);
            ExitCode::from(1)
        }
    }
}

fn analyse(program: &mut btrace_ast::Program) -> Result<Analysis> {
    match Analyser::analyse(program) {
        Ok(analysis) => Ok(analysis),
        Err(diags) => {
            diags.eprint_all();
            anyhow::bail!(
                "semantic analysis failed with {} error(s)",
                diags.error_count()
            )
        }
    }
}

fn lower(program: &btrace_ast::Program, analysis: &Analysis) -> IrProgram {
    let mut ir = CodeGen::compile(program, analysis);
    ir.inline_helpers();
    ir
}

fn run(source: &str, debug: bool) -> Result<()> {
    let mut parser = btrace_parser::Parser::new(source)?;
    let mut program = parser.parse()?;

    if debug {
        print!("{}", Printer::new().print(&mut program));
    }

    let analysis = analyse(&mut program)?;
    let maps = MapSet::create(&analysis, debug)?;
    let ir = lower(&program, &analysis);

    if debug {
        print!("{}", ir.render());
        return Ok(());
    }

    let mut runtime = Runtime::new(&program, analysis, &ir, maps)?;
    match runtime.num_probes() {
        0 => anyhow::bail!("No probes to attach"),
        1 => println!("Attaching 1 probe..."),
        n => println!("Attaching {} probes...", n),
    }

    runtime.run()?;
    println!("\n");
    runtime.print_maps()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn compile(source: &str) -> Result<(Analysis, MapSet, IrProgram)> {
        let mut parser = btrace_parser::Parser::new(source)?;
        let mut program = parser.parse()?;
        let analysis = analyse(&mut program)?;
        let maps = MapSet::create(&analysis, true)?;
        let ir = lower(&program, &analysis);
        Ok((analysis, maps, ir))
    }

    #[test]
    fn compile_builds_maps_and_sections() {
        let (analysis, maps, ir) = compile("kprobe:f { @x[pid] = count(); }").unwrap();
        assert!(analysis.maps.contains_key("x"));
        assert!(maps.handles.contains_key("x"));
        assert!(ir.encode_sections().contains_key("s_kprobe:f"));
    }

    #[test]
    fn compile_reports_semantic_errors() {
        let err = compile("kprobe:f { nope }").expect_err("should fail");
        assert!(err.to_string().contains("semantic analysis failed"));
    }

    #[test]
    fn debug_dump_renders_ast_and_ir() {
        let (_, _, ir) = compile("kprobe:f { @c = count(); }").unwrap();
        let rendered = ir.render();
        assert!(rendered.contains("fn kprobe:f section=s_kprobe:f"));
        assert!(rendered.contains("map @c"));
    }

    #[test]
    fn script_files_round_trip_through_the_parser() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "kprobe:sys_open {{ @c = count(); }}").unwrap();
        let source = fs::read_to_string(file.path()).unwrap();

        let mut parser = btrace_parser::Parser::new(&source).unwrap();
        let mut program = parser.parse().unwrap();
        let dump = Printer::new().print(&mut program);
        assert_eq!(
            dump,
            "Program\n kprobe:sys_open\n  =\n   map: @c\n   call: count\n"
        );
    }
}
