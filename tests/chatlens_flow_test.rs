use std::fs;
use std::path::Path;

use predicates::prelude::*;
use tempfile::tempdir;

fn write_export(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("export.json");
    let export = serde_json::json!([
        {
            "id": "m1",
            "threadId": {"$oid": "thread_a"},
            "role": "user",
            "content": "how do I structure a bridge?",
            "createdAt": {"$date": "2025-03-01T10:00:00Z"},
        },
        {
            "id": "m2",
            "threadId": {"$oid": "thread_a"},
            "role": "assistant",
            "content": [{"type": "text", "text": "start from the chorus chords"}],
            "createdAt": {"$date": "2025-03-01T10:01:00Z"},
        },
        {
            "id": "m3",
            "threadId": {"$oid": "thread_b"},
            "role": "user",
            "content": "can you suggest lyrics?",
            "createdAt": {"$date": "2025-03-02T09:00:00Z"},
        },
    ]);
    fs::write(&path, serde_json::to_string_pretty(&export).unwrap()).unwrap();
    path
}

#[test]
fn extract_analyze_results_round_trip() {
    let tmp = tempdir().expect("tempdir");
    let export = write_export(tmp.path());

    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .arg("extract")
        .arg(&export)
        .assert()
        .success()
        .stdout(predicate::str::contains("threads_found=2"))
        .stdout(predicate::str::contains("threads_stored=2"));

    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .args(["analyze", "--mock"])
        .assert()
        .success()
        .stdout(predicate::str::contains("provider=mock"))
        .stdout(predicate::str::contains("batch completed"));

    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .arg("results")
        .assert()
        .success()
        .stdout(predicate::str::contains("threads=2"))
        .stdout(predicate::str::contains("mock=2"))
        .stdout(predicate::str::contains("average_score=8.5"));

    // everything already analyzed, so a second batch has nothing to do
    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .args(["analyze", "--mock"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no unanalyzed threads found"));
}

#[test]
fn re_extracting_the_same_file_adds_nothing() {
    let tmp = tempdir().expect("tempdir");
    let export = write_export(tmp.path());

    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .args(["extract", export.to_str().unwrap(), "--session", "s1"])
        .assert()
        .success();

    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .args(["extract", export.to_str().unwrap(), "--session", "s1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("new_messages=0"))
        .stdout(predicate::str::contains("threads_stored=0"));
}

#[test]
fn html_upload_is_rejected_with_failure_exit() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("page.json");
    fs::write(&path, "<!DOCTYPE html><html><body>login</body></html>").unwrap();

    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .arg("extract")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("HTML"));
}

#[test]
fn threads_listing_paginates_and_shows_state() {
    let tmp = tempdir().expect("tempdir");
    let export = write_export(tmp.path());

    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .arg("extract")
        .arg(&export)
        .assert()
        .success();

    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .args(["threads", "--per-page", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("page 1/2 (2 threads total)"))
        .stdout(predicate::str::contains("thread_b"))
        .stdout(predicate::str::contains("[pending]"));

    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .args(["thread", "thread_a"])
        .assert()
        .success()
        .stdout(predicate::str::contains("USER: how do I structure a bridge?"));
}

#[test]
fn status_reports_counts_on_fresh_home() {
    let tmp = tempdir().expect("tempdir");

    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("threads: total=0 analyzed=0"))
        .stdout(predicate::str::contains("latest_analysis=none"));
}

#[test]
fn reset_unflags_threads_and_clears_results() {
    let tmp = tempdir().expect("tempdir");
    let export = write_export(tmp.path());

    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .arg("extract")
        .arg(&export)
        .assert()
        .success();

    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .args(["analyze", "--mock"])
        .assert()
        .success();

    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .arg("reset")
        .assert()
        .success()
        .stdout(predicate::str::contains("threads_unflagged=2"));

    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("total=2 analyzed=0"))
        .stdout(predicate::str::contains("latest_analysis=none"));
}

#[test]
fn chunk_command_splits_and_writes_files() {
    let tmp = tempdir().expect("tempdir");
    let input = tmp.path().join("big.txt");
    let mut text = String::new();
    for i in 0..200 {
        text.push_str(&format!("USER: message {i} with a bit of padding text\n"));
    }
    fs::write(&input, &text).unwrap();

    let out_dir = tmp.path().join("chunks");
    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .args([
            "chunk",
            input.to_str().unwrap(),
            "--max-size",
            "1000",
            "--output",
            out_dir.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("chunk files under"));

    let written = fs::read_dir(&out_dir).unwrap().count();
    assert!(written > 1);

    // chunks concatenate back to the original input
    let mut paths: Vec<_> = fs::read_dir(&out_dir).unwrap().flatten().map(|e| e.path()).collect();
    paths.sort_by_key(|p| {
        p.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("chunk_"))
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0)
    });
    let mut rebuilt = String::new();
    for p in paths {
        rebuilt.push_str(&fs::read_to_string(p).unwrap());
    }
    assert_eq!(rebuilt, text);
}

#[test]
fn chunk_analyze_saves_a_combined_report() {
    let tmp = tempdir().expect("tempdir");
    let input = tmp.path().join("transcript.txt");
    let mut text = String::new();
    for i in 0..200 {
        text.push_str(&format!("USER: message {i} with a bit of padding text\n"));
    }
    fs::write(&input, &text).unwrap();

    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .args([
            "chunk",
            input.to_str().unwrap(),
            "--max-size",
            "1000",
            "--analyze",
            "--mock",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("provider=mock"))
        .stdout(predicate::str::contains("units=1 (real=0 mock=1)"));

    // the saved report is what `results` now shows
    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .arg("results")
        .assert()
        .success()
        .stdout(predicate::str::contains("average_score=8.5"))
        .stdout(predicate::str::contains("(real=0 mock=1)"));
}

#[test]
fn chunk_with_zero_budget_finishes() {
    let tmp = tempdir().expect("tempdir");
    let input = tmp.path().join("tiny.txt");
    fs::write(&input, "USER: hi\n").unwrap();

    assert_cmd::cargo::cargo_bin_cmd!("chatlens")
        .env("CHATLENS_HOME", tmp.path())
        .args(["chunk", input.to_str().unwrap(), "--max-size", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("chunks=9"));
}
