//! End-to-end checks of the `capture-relay` binary.

use std::process::Command;

use capture_relay::capture::synthetic::sequence_of;

/// 48 kHz stereo s16le, 10 ms periods.
const BLOCK_BYTES: usize = 480 * 2 * 2;

#[test]
fn test_simulate_to_stdout_writes_only_audio() {
    let output = Command::new(env!("CARGO_BIN_EXE_capture-relay"))
        .args([
            "simulate",
            "--seconds",
            "1",
            "--no-realtime",
            "--period-ms",
            "10",
            "-o",
            "-",
        ])
        .output()
        .expect("failed to run capture-relay");

    assert!(output.status.success(), "{:?}", output);

    // The banner and the stats report go to stderr.
    let stdout = output.stdout;
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Simulating"));
    assert!(stderr.contains("Relay Statistics"));

    assert!(!stdout.is_empty());
    assert_eq!(stdout.len() % BLOCK_BYTES, 0);
    let first = sequence_of(&stdout[..BLOCK_BYTES]).expect("sequence stamp");
    assert!(first < 100, "first block carries sequence {}", first);
    assert!(!stdout
        .windows(b"Simulating".len())
        .any(|w| w == b"Simulating"));
}
