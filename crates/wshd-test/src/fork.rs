use std::process::{Command, ExitCode, Stdio};

const IN_TEST_VAR: &str = "WSHD_IN_TEST";

/// True inside the re-executed child that runs the actual test body.
pub fn in_host() -> bool {
    std::env::var_os(IN_TEST_VAR).is_some()
}

/// Re-executes the current test binary to run exactly one test.
pub fn run(module: &str, test: &str) -> ExitCode {
    let exe = std::env::current_exe().expect("get the current executable");

    // module_path!() starts with the crate name, which is not part of the
    // libtest filter.
    let filter = match module.split_once("::") {
        Some((_, rest)) => format!("{rest}::{test}"),
        None => test.to_string(),
    };

    let mut child = Command::new(exe)
        .args([
            "--quiet",
            "--test-threads",
            "1",
            "--nocapture",
            "--exact",
            "--",
            &filter,
        ])
        .env(IN_TEST_VAR, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("test process executes");

    if child.wait().expect("wait for test process").success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
