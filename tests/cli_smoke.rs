use std::path::PathBuf;
use std::process::Command;

mod helpers;
use helpers::{reserve_local_port, unique_test_temp_dir, write_file};

fn run_fanout(args: &[&str]) -> std::process::Output {
    // This env var is provided by Cargo for integration tests.
    let exe = env!("CARGO_BIN_EXE_fanout");
    Command::new(exe)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("run fanout binary")
}

fn write_inventory(prefix: &str, yaml: &str) -> PathBuf {
    let dir = unique_test_temp_dir(prefix);
    write_file(&dir, "inventory.yaml", yaml.as_bytes())
}

const WEB: &str = r#"
all:
  vars:
    user: admin
  groups:
    web:
      hosts:
        a:
        b:
          port: 2222
"#;

#[test]
fn list_hosts_prints_resolved_targets() {
    let inv = write_inventory("cli-list", WEB);
    let out = run_fanout(&["-i", inv.to_str().unwrap(), "--list-hosts"]);
    assert!(
        out.status.success(),
        "expected success, stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("web a:22 user=admin"), "stdout:\n{stdout}");
    assert!(stdout.contains("web b:2222 user=admin"), "stdout:\n{stdout}");
    assert!(stdout.contains("目标主机数: 2"), "stdout:\n{stdout}");
}

#[test]
fn list_hosts_honors_filter() {
    let inv = write_inventory("cli-filter", WEB);
    let out = run_fanout(&["-i", inv.to_str().unwrap(), "-l", "b", "--list-hosts"]);
    assert!(out.status.success());

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("b:2222"), "stdout:\n{stdout}");
    assert!(!stdout.contains("a:22"), "stdout:\n{stdout}");
}

#[test]
fn unreachable_host_is_counted_and_exit_is_still_zero() {
    let port = reserve_local_port();
    let inv = write_inventory(
        "cli-unreachable",
        &format!(
            "all:\n  groups:\n    local:\n      hosts:\n        127.0.0.1:\n          port: {port}\n"
        ),
    );

    let out = run_fanout(&[
        "-i",
        inv.to_str().unwrap(),
        "-a",
        "echo hi",
        "-o",
        "detail",
        "-t",
        "5s",
    ]);
    assert!(
        out.status.success(),
        "per-host failures must not change the exit code, stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("模式: exec, 目标主机数: 1"), "stdout:\n{stdout}");
    assert!(
        stdout.contains(&format!("[127.0.0.1:{port}] 失败:")),
        "stdout:\n{stdout}"
    );
    assert!(
        stdout.contains("执行完成: 成功:0 失败:1 总数:1"),
        "stdout:\n{stdout}"
    );
}

#[test]
fn invalid_port_aborts_before_dispatch() {
    let inv = write_inventory(
        "cli-bad-port",
        "all:\n  groups:\n    web:\n      hosts:\n        broken:\n          port: \"ssh\"\n",
    );
    let out = run_fanout(&["-i", inv.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("broken"), "stderr:\n{stderr}");
    assert!(out.stdout.is_empty(), "nothing should be dispatched");
}

#[test]
fn missing_inventory_is_fatal() {
    let dir = unique_test_temp_dir("cli-missing");
    let path = dir.join("nope.yaml");
    let out = run_fanout(&["-i", path.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("failed to load inventory"));
}

#[test]
fn copy_mode_accepts_single_dash_src_and_dst() {
    let inv = write_inventory("cli-copy", WEB);
    let src = unique_test_temp_dir("cli-copy-src");
    let out = run_fanout(&[
        "-i",
        inv.to_str().unwrap(),
        "-m",
        "copy",
        "-src",
        src.to_str().unwrap(),
        "-dst",
        "/tmp/dest",
        "--list-hosts",
    ]);
    assert!(
        out.status.success(),
        "stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
}

#[test]
fn copy_mode_without_paths_is_rejected() {
    let inv = write_inventory("cli-copy-missing", WEB);
    let out = run_fanout(&["-i", inv.to_str().unwrap(), "-m", "copy"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("-src and -dst"));
}

#[test]
fn copy_mode_takes_repeated_pairs_in_order() {
    let port = reserve_local_port();
    let inv = write_inventory(
        "cli-copy-pairs",
        &format!(
            "all:\n  groups:\n    local:\n      hosts:\n        127.0.0.1:\n          port: {port}\n"
        ),
    );
    let src = unique_test_temp_dir("cli-copy-pairs-src");
    let conf = write_file(&src, "app.conf", b"x=1");
    let spec = format!("{}:/etc/app.conf", conf.display());

    let out = run_fanout(&[
        "-i",
        inv.to_str().unwrap(),
        "-m",
        "copy",
        "-src",
        src.to_str().unwrap(),
        "-dst",
        "/srv/tree",
        "-copy",
        &spec,
        "-t",
        "5s",
    ]);
    assert!(
        out.status.success(),
        "stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );

    let stdout = String::from_utf8_lossy(&out.stdout);
    let first = format!("复制: {} -> /srv/tree", src.display());
    let second = format!("复制: {} -> /etc/app.conf", conf.display());
    let (Some(a), Some(b)) = (stdout.find(&first), stdout.find(&second)) else {
        panic!("missing copy lines in stdout:\n{stdout}");
    };
    assert!(a < b, "pairs out of order:\n{stdout}");
    assert!(stdout.contains("执行完成: 成功:0 失败:1 总数:1"), "stdout:\n{stdout}");
}
