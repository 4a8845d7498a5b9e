//! End-to-end tests against real files and a real Lua interpreter.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fs_set_times::{SystemTimeSpec, set_mtime};
use magnet::mlua::{Function, Lua};
use magnet::{
    ArtifactCompiler, CompileFailure, HostConfig, LuaCompiler, Outcome, ResolveError, Sandbox,
    ScriptCache, ScriptHost, Status,
};
use tempfile::TempDir;

/// Wraps the real compiler to count how often it is invoked.
struct CountingCompiler {
    inner: LuaCompiler,
    compiles: Cell<usize>,
}

impl ArtifactCompiler for CountingCompiler {
    type Artifact = Function;

    fn compile(&self, path: &Path) -> Result<Function, CompileFailure> {
        self.compiles.set(self.compiles.get() + 1);
        self.inner.compile(path)
    }
}

fn counting_cache(lua: &Lua) -> ScriptCache<CountingCompiler> {
    ScriptCache::new(CountingCompiler {
        inner: LuaCompiler::new(lua.clone()),
        compiles: Cell::new(0),
    })
}

fn write_script(dir: &TempDir, name: &str, source: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, source).unwrap();
    path
}

fn bump_mtime(path: &Path, seconds: u64) {
    let mtime = SystemTime::now() + Duration::from_secs(seconds);
    set_mtime(path, SystemTimeSpec::Absolute(mtime)).unwrap();
}

fn serve(host: &mut ScriptHost, path: Option<&str>) -> (Outcome, String) {
    let mut out = Vec::new();
    let outcome = host.serve(path, &mut out).unwrap();
    (outcome, String::from_utf8(out).unwrap())
}

// =============================================================================
// Cache
// =============================================================================

#[test]
fn repeated_resolution_compiles_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_script(&dir, "index.lua", "print('hi')");
    let path = path.to_str().unwrap();

    let lua = Lua::new();
    let mut cache = counting_cache(&lua);

    for _ in 0..10 {
        cache.resolve(Some(path)).unwrap();
    }

    assert_eq!(cache.compiler().compiles.get(), 1);
    assert_eq!(cache.entry(path).unwrap().hit_count, 9);
}

#[test]
fn touching_a_script_recompiles_it_once() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "index.lua", "print('hi')");
    let path = script.to_str().unwrap();

    let lua = Lua::new();
    let mut cache = counting_cache(&lua);
    cache.resolve(Some(path)).unwrap();
    cache.resolve(Some(path)).unwrap();

    // Same content, new mtime.
    bump_mtime(&script, 10);

    cache.resolve(Some(path)).unwrap();
    assert_eq!(cache.compiler().compiles.get(), 2);
    assert_eq!(cache.entry(path).unwrap().hit_count, 0);

    cache.resolve(Some(path)).unwrap();
    assert_eq!(cache.compiler().compiles.get(), 2);
    assert_eq!(cache.entry(path).unwrap().hit_count, 1);
}

#[test]
fn edited_script_runs_new_code() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "page.lua", "print('v1')");
    let path = script.to_str().unwrap();
    let mut host = ScriptHost::new(HostConfig::default()).unwrap();

    assert_eq!(serve(&mut host, Some(path)).1, "v1");

    fs::write(&script, "print('v2')").unwrap();
    bump_mtime(&script, 10);

    assert_eq!(serve(&mut host, Some(path)).1, "v2");
}

#[test]
fn touching_one_script_leaves_the_other_cached() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_script(&dir, "a.lua", "print('a')");
    let b = write_script(&dir, "b.lua", "print('b')");
    let (a_path, b_path) = (a.to_str().unwrap(), b.to_str().unwrap());

    let lua = Lua::new();
    let mut cache = counting_cache(&lua);
    cache.resolve(Some(a_path)).unwrap();
    cache.resolve(Some(b_path)).unwrap();
    cache.resolve(Some(a_path)).unwrap();

    bump_mtime(&b, 10);
    cache.resolve(Some(b_path)).unwrap();
    cache.resolve(Some(a_path)).unwrap();

    assert_eq!(cache.compiler().compiles.get(), 3);
    assert_eq!(cache.entry(a_path).unwrap().hit_count, 2);
    assert_eq!(cache.entry(b_path).unwrap().hit_count, 0);
}

// =============================================================================
// Error mapping
// =============================================================================

#[test]
fn missing_file_is_not_found() {
    let lua = Lua::new();
    let mut cache = counting_cache(&lua);
    let err = cache.resolve(Some("/no/such/file")).unwrap_err();
    assert!(matches!(err, ResolveError::NotFound { .. }));
    assert_eq!(err.status(), Status::NotFound);
}

#[test]
fn directory_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let lua = Lua::new();
    let mut cache = counting_cache(&lua);

    let err = cache.resolve(dir.path().to_str()).unwrap_err();
    assert!(matches!(err, ResolveError::BadRequest(_)));

    #[cfg(unix)]
    assert!(matches!(
        cache.resolve(Some("/etc")),
        Err(ResolveError::BadRequest(_))
    ));
}

#[test]
fn empty_path_is_bad_request() {
    let lua = Lua::new();
    let mut cache = counting_cache(&lua);
    assert!(matches!(
        cache.resolve(Some("")),
        Err(ResolveError::BadRequest(_))
    ));
    assert_eq!(cache.compiler().compiles.get(), 0);
}

#[test]
fn syntax_error_is_a_200_page_and_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "broken.lua", "print('a'\n");
    let path = script.to_str().unwrap();
    let mut host = ScriptHost::new(HostConfig::default()).unwrap();

    let (outcome, body) = serve(&mut host, Some(path));

    assert_eq!(outcome, Outcome::ResolutionFailed(Status::Ok));
    assert!(
        body.starts_with("Content-Type: text/html\r\nStatus: 200 OK\r\n\r\n"),
        "{body}"
    );
    assert!(body.contains("broken.lua:"), "{body}");
    assert!(host.cache().is_empty());
    assert_eq!(host.counters().total_served, 0);
    assert_eq!(host.counters().resolution_failures, 1);
}

#[cfg(unix)]
#[test]
fn unreadable_script_is_forbidden() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "secret.lua", "print('x')");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o000)).unwrap();

    // Root can read anything; nothing to check there.
    if fs::read(&script).is_ok() {
        return;
    }

    let mut host = ScriptHost::new(HostConfig::default()).unwrap();
    let (outcome, body) = serve(&mut host, script.to_str());
    assert_eq!(outcome, Outcome::ResolutionFailed(Status::Forbidden));
    assert!(body.ends_with("\r\n\r\n403 Forbidden\r\n"), "{body}");
}

#[test]
fn missing_script_gets_status_only_response() {
    let mut host = ScriptHost::new(HostConfig::default()).unwrap();
    let (outcome, body) = serve(&mut host, Some("/no/such/file"));
    assert_eq!(outcome, Outcome::ResolutionFailed(Status::NotFound));
    assert_eq!(
        body,
        "Content-Type: text/html\r\nStatus: 404 Not Found\r\n\r\n404 Not Found\r\n"
    );
}

// =============================================================================
// Sandbox
// =============================================================================

#[test]
fn print_writes_stringified_arguments_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "a42.lua", "print(\"a\", 42)");
    let mut host = ScriptHost::new(HostConfig::default()).unwrap();

    let (outcome, body) = serve(&mut host, script.to_str());

    assert_eq!(outcome, Outcome::Succeeded);
    assert_eq!(body, "a42");
}

#[test]
fn scripts_print_their_own_headers() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        &dir,
        "hello.lua",
        r#"print("Content-Type: text/plain\r\n\r\n", "hello")"#,
    );
    let mut host = ScriptHost::new(HostConfig::default()).unwrap();

    let (_, body) = serve(&mut host, script.to_str());
    assert_eq!(body, "Content-Type: text/plain\r\n\r\nhello");
}

#[test]
fn globals_do_not_survive_between_requests() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        &dir,
        "count.lua",
        "visits = (visits or 0) + 1 print(visits)",
    );
    let other = write_script(&dir, "peek.lua", "print(tostring(visits))");
    let mut host = ScriptHost::new(HostConfig::default()).unwrap();

    assert_eq!(serve(&mut host, script.to_str()).1, "1");
    assert_eq!(serve(&mut host, script.to_str()).1, "1");
    assert_eq!(serve(&mut host, other.to_str()).1, "nil");
    assert!(host.sandbox().base().get::<magnet::mlua::Value>("visits").unwrap().is_nil());
}

#[test]
fn standard_library_is_reachable() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        &dir,
        "std.lua",
        "print(string.format('%03d', 7), table.concat({'x', 'y'}, ','))",
    );
    let mut host = ScriptHost::new(HostConfig::default()).unwrap();
    assert_eq!(serve(&mut host, script.to_str()).1, "007x,y");
}

#[test]
fn sandboxes_from_one_interpreter_are_isolated() {
    let lua = Lua::new();
    let sandbox = Sandbox::new(&lua).unwrap();
    let set = lua.load("leaked = 'yes'").into_function().unwrap();
    let get = lua.load("print(tostring(leaked))").into_function().unwrap();

    sandbox.run(&set, &mut Vec::new()).unwrap();
    let mut out = Vec::new();
    sandbox.run(&get, &mut out).unwrap();

    assert_eq!(out, b"nil");
}

#[test]
fn loaded_chunks_cannot_write_the_base_environment() {
    let dir = tempfile::tempdir().unwrap();
    let writer = write_script(&dir, "writer.lua", "load('leaked = 1')()");
    let via_package = write_script(&dir, "package.lua", "package.loaded._G.leaked = 2");
    let reader = write_script(&dir, "reader.lua", "print(tostring(leaked))");
    let mut host = ScriptHost::new(HostConfig::default()).unwrap();

    let (outcome, body) = serve(&mut host, writer.to_str());
    assert_eq!(outcome, Outcome::RuntimeFailed);
    assert!(body.contains("read-only base environment"), "{body}");
    assert_eq!(serve(&mut host, via_package.to_str()).0, Outcome::RuntimeFailed);

    assert_eq!(serve(&mut host, reader.to_str()).1, "nil");
    assert!(host.sandbox().base().get::<magnet::mlua::Value>("leaked").unwrap().is_nil());
}

// =============================================================================
// Runtime failures and counters
// =============================================================================

#[test]
fn runtime_error_is_appended_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "fail.lua", "print('before ') error('kaboom')");
    let mut host = ScriptHost::new(HostConfig::default()).unwrap();

    let (outcome, body) = serve(&mut host, script.to_str());

    assert_eq!(outcome, Outcome::RuntimeFailed);
    assert!(body.starts_with("before "), "{body}");
    assert!(body.contains("fail.lua:1: kaboom"), "{body}");
    assert!(!body.contains("runtime error:"), "{body}");
}

#[test]
fn counters_follow_attempted_executions() {
    let dir = tempfile::tempdir().unwrap();
    let ok = write_script(&dir, "ok.lua", "print('ok')");
    let bad = write_script(&dir, "bad.lua", "error('no')");
    let (ok, bad) = (ok.to_str().unwrap(), bad.to_str().unwrap());
    let mut host = ScriptHost::new(HostConfig::default()).unwrap();

    serve(&mut host, Some(ok));
    serve(&mut host, Some(ok));
    serve(&mut host, Some(bad));
    serve(&mut host, Some("/no/such/file"));
    serve(&mut host, None);

    let counters = host.counters();
    assert_eq!(counters.total_served, 3);
    assert_eq!(counters.runtime_failures, 1);
    assert_eq!(counters.resolution_failures, 2);

    let ok_stats = host.cache().entry(ok).unwrap();
    assert_eq!(ok_stats.executions, 2);
    assert_eq!(ok_stats.hit_count, 1);
    assert_eq!(host.cache().entry(bad).unwrap().executions, 1);
}

#[test]
fn host_keeps_serving_after_failures() {
    let dir = tempfile::tempdir().unwrap();
    let bad = write_script(&dir, "bad.lua", "local t = nil; print(t.field)");
    let good = write_script(&dir, "good.lua", "print('fine')");
    let mut host = ScriptHost::new(HostConfig::default()).unwrap();

    assert_eq!(serve(&mut host, bad.to_str()).0, Outcome::RuntimeFailed);
    assert_eq!(serve(&mut host, Some("")).0, Outcome::ResolutionFailed(Status::BadRequest));
    assert_eq!(serve(&mut host, good.to_str()), (Outcome::Succeeded, "fine".to_string()));
}

#[test]
fn bounded_host_evicts_old_scripts() {
    let dir = tempfile::tempdir().unwrap();
    let scripts: Vec<_> = (0..3)
        .map(|i| write_script(&dir, &format!("s{i}.lua"), &format!("print({i})")))
        .collect();
    let config = HostConfig::new().with_max_cache_entries(std::num::NonZeroUsize::new(2).unwrap());
    let mut host = ScriptHost::new(config).unwrap();

    for script in &scripts {
        serve(&mut host, script.to_str());
    }

    assert_eq!(host.cache().len(), 2);
    assert!(host.cache().entry(&scripts[0]).is_none());
    assert_eq!(serve(&mut host, scripts[0].to_str()).1, "0");
}

#[test]
fn independent_hosts_do_not_share_caches() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "x.lua", "print('x')");
    let mut first = ScriptHost::new(HostConfig::default()).unwrap();
    let second = ScriptHost::new(HostConfig::default()).unwrap();

    serve(&mut first, script.to_str());

    assert_eq!(first.cache().len(), 1);
    assert!(second.cache().is_empty());
    assert_eq!(second.counters().total_served, 0);
}

#[test]
fn memory_exhaustion_while_compiling_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let huge = format!("local s = \"{}\" print(#s)", "x".repeat(8 * 1024 * 1024));
    let script = write_script(&dir, "huge.lua", &huge);
    let config = HostConfig::new().with_memory_limit(2 * 1024 * 1024);
    let mut host = ScriptHost::new(config).unwrap();

    let (outcome, _) = serve(&mut host, script.to_str());

    assert_eq!(outcome, Outcome::ResolutionFailed(Status::ServiceUnavailable));
    assert!(host.cache().is_empty());
}
