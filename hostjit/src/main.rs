use clap::{Args, Parser as ClapParser, Subcommand, ValueEnum};
use std::{fs, path::PathBuf, process, sync::Arc};

use hostjit::{
    CollectingSink, EngineCreateInfo, FrontendCreateInfo, IntermediateModule, LinkEngine, LogSink,
    OptLevel, PoolSettings, Tee, call_int_entry, frontend_for, parse_define,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile, link and call an entry point
    Run(RunArgs),
    /// Only compile and report diagnostics
    Check(CheckArgs),
}

#[derive(Args, Debug)]
struct SourceArgs {
    #[arg(help = "The C/C++ source file")]
    file: PathBuf,

    #[arg(short = 'I', value_name = "DIR", help = "Add a header search directory")]
    include: Vec<PathBuf>,

    #[arg(short = 'D', value_name = "NAME[=VALUE]", help = "Define a macro")]
    define: Vec<String>,

    /// Compile this header first and apply it to the source
    #[arg(long, value_name = "FILE", requires = "pch_out")]
    pch_source: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Where the header cache is written")]
    pch_out: Option<PathBuf>,

    #[arg(long, value_name = "PATH", conflicts_with = "pch_source")]
    #[arg(help = "Use a header cache written by an earlier run")]
    pch: Option<PathBuf>,

    #[arg(long, help = "Define NDEBUG")]
    release: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    source: SourceArgs,

    #[arg(long, default_value = "main", help = "Symbol of `int NAME(int...)` to call")]
    entry: String,

    #[arg(long = "arg", value_name = "N", allow_negative_numbers = true)]
    #[arg(help = "Integer argument for the entry point (up to four)")]
    args: Vec<i32>,

    #[arg(long, value_name = "PATH", help = "Import archive to resolve symbols from")]
    archive: Vec<PathBuf>,

    #[arg(long = "lib", value_name = "NAME", help = "Shared library to resolve symbols from")]
    libraries: Vec<String>,

    #[arg(long, default_value = "main", help = "Name of the code region")]
    region: String,

    #[arg(long, value_enum, default_value_t = Opt::Speed)]
    opt_level: Opt,

    #[arg(long, help = "Compile workers (default: available parallelism)")]
    workers: Option<usize>,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[command(flatten)]
    source: SourceArgs,

    #[arg(long, help = "Print the module's symbols and IR")]
    emit_ir: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Opt {
    None,
    Speed,
    SpeedAndSize,
}

impl From<Opt> for OptLevel {
    fn from(opt: Opt) -> Self {
        match opt {
            Opt::None => OptLevel::None,
            Opt::Speed => OptLevel::Speed,
            Opt::SpeedAndSize => OptLevel::SpeedAndSize,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(args),
        Command::Check(args) => check(args),
    }
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    process::exit(1);
}

fn run(args: RunArgs) {
    if args.args.len() > 4 {
        fail("at most four --arg values are supported");
    }
    let mut pool = PoolSettings::default();
    if let Some(workers) = args.workers {
        pool.workers = workers;
    }
    let engine = LinkEngine::new(EngineCreateInfo {
        pool,
        opt_level: args.opt_level.into(),
        archives: args.archive.clone(),
        libraries: args.libraries.clone(),
        ..EngineCreateInfo::default()
    })
    .unwrap_or_else(|err| fail(format!("cannot start the link engine: {err}")));

    let (module, _) = compile(&engine, &args.source);

    let mut region = engine
        .create_code_region(&args.region)
        .unwrap_or_else(|err| fail(err));
    region.add_module(module).unwrap_or_else(|err| fail(err));
    region.initialize().unwrap_or_else(|err| fail(err));
    let entry = region
        .lookup_address(&args.entry)
        .unwrap_or_else(|err| fail(err));

    // SAFETY: the entry point is declared `int NAME(int...)` by contract
    // with the user and the argument count was checked above
    let result = unsafe { call_int_entry(entry, &args.args) };
    match result {
        Some(value) => println!("{}", value),
        None => fail("unsupported argument count"),
    }

    region.deinitialize().unwrap_or_else(|err| fail(err));
    region.destroy().unwrap_or_else(|err| fail(err));
}

fn check(args: CheckArgs) {
    let engine = LinkEngine::new(EngineCreateInfo {
        pool: PoolSettings {
            workers: 1,
            ..PoolSettings::default()
        },
        ..EngineCreateInfo::default()
    })
    .unwrap_or_else(|err| fail(format!("cannot detect the host target: {err}")));
    let (module, diagnostics) = compile(&engine, &args.source);
    if args.emit_ir {
        print!("{}", module);
    }
    println!("{}: ok ({})", args.source.file.display(), diagnostics.summary());
}

/// Compiles the source file, exiting when it has errors.
fn compile(engine: &LinkEngine, source: &SourceArgs) -> (IntermediateModule, Arc<CollectingSink>) {
    let mut include_dirs = source.include.clone();
    if let Some(parent) = source.file.parent().filter(|p| !p.as_os_str().is_empty()) {
        include_dirs.push(parent.to_path_buf());
    }
    let info = FrontendCreateInfo {
        include_dirs,
        defines: source.define.iter().map(|d| parse_define(d)).collect(),
        release: source.release,
        implicit_header: source.pch.clone(),
        ..FrontendCreateInfo::default()
    };
    let diagnostics = Arc::new(CollectingSink::new());
    let sink = Tee::new().with(Arc::new(LogSink)).with(diagnostics.clone());
    let mut frontend = frontend_for(engine, info, Arc::new(sink))
        .unwrap_or_else(|err| fail(format!("cannot load the header cache: {err}")));

    if let (Some(header), Some(out)) = (&source.pch_source, &source.pch_out) {
        let text = fs::read_to_string(header)
            .unwrap_or_else(|err| fail(format!("reading '{}': {err}", header.display())));
        frontend
            .generate_precompiled_header(&text, out)
            .unwrap_or_else(|err| fail(err));
    }

    let text = fs::read_to_string(&source.file)
        .unwrap_or_else(|err| fail(format!("reading '{}': {err}", source.file.display())));
    let name = source
        .file
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main".to_string());
    let module = frontend.compile(&text, &name);
    if module.is_empty() {
        fail(format!(
            "{} failed to compile ({})",
            source.file.display(),
            diagnostics.summary()
        ));
    }
    (module, diagnostics)
}
