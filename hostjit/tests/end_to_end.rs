use std::fs;
use std::process::Command;
use std::sync::Arc;

use hostjit::{
    CollectingSink, EngineCreateInfo, FrontendCreateInfo, LinkEngine, LinkError, PoolSettings,
    RegionState, ResolverStage, Severity, StaticSymbols, call_int_entry, frontend_for,
};
use tempdir::TempDir;

fn engine(info: EngineCreateInfo) -> LinkEngine {
    LinkEngine::new(EngineCreateInfo {
        pool: PoolSettings {
            workers: 2,
            ..PoolSettings::default()
        },
        ..info
    })
    .unwrap()
}

extern "C" fn host_scale(x: i32) -> i32 {
    x * 10
}

#[test]
fn host_functions_are_callable_from_jitted_code() {
    let symbols = StaticSymbols::new().with("host_scale", host_scale as usize);
    let engine = engine(EngineCreateInfo {
        host_symbols: vec![Box::new(symbols)],
        ..EngineCreateInfo::default()
    });
    let sink = Arc::new(CollectingSink::new());
    let mut frontend = frontend_for(&engine, FrontendCreateInfo::default(), sink.clone()).unwrap();
    let module = frontend.compile(
        "extern \"C\" int host_scale(int x);\n\
         extern \"C\" int entry(int a, int b) { return host_scale(a) + b; }\n",
        "scale",
    );
    assert!(!module.is_empty(), "{:?}", sink.snapshot());

    let mut region = engine.create_code_region("scale").unwrap();
    region.add_module(module).unwrap();
    let entry = region.lookup_address("entry").unwrap();
    assert_eq!(unsafe { call_int_entry(entry, &[4, 2]) }, Some(42));
    let stage = region
        .symbol_references()
        .iter()
        .find(|r| r.name == "host_scale")
        .and_then(|r| r.stage);
    assert_eq!(stage, Some(ResolverStage::Host));
}

#[test]
fn compile_errors_never_reach_the_engine() {
    let engine = engine(EngineCreateInfo::default());
    let sink = Arc::new(CollectingSink::new());
    let mut frontend = frontend_for(&engine, FrontendCreateInfo::default(), sink.clone()).unwrap();
    let module = frontend.compile("int broken() { return missing; }\n", "broken");
    assert!(module.is_empty());
    assert!(sink.has_errors());

    let mut region = engine.create_code_region("broken").unwrap();
    assert!(matches!(
        region.add_module(module),
        Err(LinkError::EmptyModule(_))
    ));
}

#[test]
fn precompiled_header_is_shared_by_later_modules() {
    let dir = TempDir::new("hostjit-pch").unwrap();
    let cache = dir.path().join("prelude.pch");
    let engine = engine(EngineCreateInfo::default());
    let sink = Arc::new(CollectingSink::new());

    let mut frontend = frontend_for(&engine, FrontendCreateInfo::default(), sink.clone()).unwrap();
    frontend
        .generate_precompiled_header(
            "#define OFFSET 100\ninline int offset(int x) { return x + OFFSET; }\n",
            &cache,
        )
        .unwrap();
    assert!(cache.exists());

    // a fresh frontend picks the cache up from its configuration
    let mut later = frontend_for(
        &engine,
        FrontendCreateInfo {
            implicit_header: Some(cache.clone()),
            ..FrontendCreateInfo::default()
        },
        sink.clone(),
    )
    .unwrap();
    let module = later.compile(
        "extern \"C\" int shifted(int x) { return offset(x) + OFFSET; }\n",
        "shifted",
    );
    assert!(!module.is_empty(), "{:?}", sink.snapshot());

    let mut region = engine.create_code_region("pch").unwrap();
    region.add_module(module).unwrap();
    let shifted = region.lookup_address("shifted").unwrap();
    assert_eq!(unsafe { call_int_entry(shifted, &[1]) }, Some(201));
}

#[test]
fn regions_are_isolated() {
    let engine = engine(EngineCreateInfo::default());
    let sink = Arc::new(CollectingSink::new());
    let mut frontend = frontend_for(&engine, FrontendCreateInfo::default(), sink.clone()).unwrap();

    let mut first = engine.create_code_region("first").unwrap();
    let mut second = engine.create_code_region("second").unwrap();
    first
        .add_module(frontend.compile("extern \"C\" int which() { return 1; }\n", "one"))
        .unwrap();
    second
        .add_module(frontend.compile("extern \"C\" int which() { return 2; }\n", "two"))
        .unwrap();
    let a = first.lookup_address("which").unwrap();
    let b = second.lookup_address("which").unwrap();
    assert_ne!(a, b);
    assert_eq!(unsafe { call_int_entry(a, &[]) }, Some(1));
    assert_eq!(unsafe { call_int_entry(b, &[]) }, Some(2));

    first.destroy().unwrap();
    assert_eq!(unsafe { call_int_entry(b, &[]) }, Some(2));
    assert_eq!(sink.count(Severity::Error), 0);
}

#[test]
fn failed_regions_can_be_recreated() {
    let engine = engine(EngineCreateInfo {
        search_process: false,
        ..EngineCreateInfo::default()
    });
    let sink = Arc::new(CollectingSink::new());
    let mut frontend = frontend_for(&engine, FrontendCreateInfo::default(), sink.clone()).unwrap();
    let source = "extern \"C\" int host_scale(int x);\n\
                  extern \"C\" int entry(int a) { return host_scale(a) + 1; }\n";

    let mut region = engine.create_code_region("retry").unwrap();
    region.add_module(frontend.compile(source, "retry")).unwrap();
    assert!(matches!(
        region.lookup_address("entry"),
        Err(LinkError::UnresolvedSymbols { names, .. }) if names == ["host_scale"]
    ));
    assert_eq!(region.state(), RegionState::Failed);
    assert!(matches!(
        region.lookup_address("entry"),
        Err(LinkError::RegionFailed(_))
    ));
    region.destroy().unwrap();

    let mut region = engine.create_code_region("retry").unwrap();
    region
        .define_absolute_symbols([("host_scale", host_scale as usize)])
        .unwrap();
    region.add_module(frontend.compile(source, "retry")).unwrap();
    let entry = region.lookup_address("entry").unwrap();
    assert_eq!(unsafe { call_int_entry(entry, &[4]) }, Some(41));
    assert_eq!(engine.live_regions(), ["retry"]);
}

// ── Command line ──

fn hostjit() -> Command {
    Command::new(env!("CARGO_BIN_EXE_hostjit"))
}

#[test]
fn cli_runs_an_entry_point() {
    let dir = TempDir::new("hostjit-cli").unwrap();
    fs::write(dir.path().join("numbers.h"), "#define BASE 40\n").unwrap();
    let source = dir.path().join("add.cpp");
    fs::write(
        &source,
        "#include \"numbers.h\"\n\
         extern \"C\" int add(int a, int b) { return BASE + a + b + EXTRA; }\n",
    )
    .unwrap();

    let output = hostjit()
        .arg("run")
        .arg(&source)
        .args(["--entry", "add", "--arg", "1", "--arg", "-2", "-D", "EXTRA=3"])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "42");
}

#[test]
fn cli_check_reports_errors() {
    let dir = TempDir::new("hostjit-check").unwrap();
    let good = dir.path().join("good.cpp");
    fs::write(&good, "int twice(int x) { return x * 2; }\n").unwrap();
    let bad = dir.path().join("bad.cpp");
    fs::write(&bad, "int twice(int x) { return y; }\n").unwrap();

    let output = hostjit().arg("check").arg(&good).arg("--emit-ir").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("_Z5twicei"), "{stdout}");
    assert!(stdout.contains("ok (0 errors, 0 warnings)"), "{stdout}");

    let output = hostjit().arg("check").arg(&bad).output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to compile (1 error, 0 warnings)"), "{stderr}");
}
