use assert_cmd::cargo::cargo_bin_cmd;
use diary_render::wire::{self, RenderReply, RenderRequest};
use diary_render::{Color, Element, Generation, PageId, PageSnapshot, Point, Stroke, StrokeTool};
use predicates::prelude::*;
use serde_json::{json, Value};
use std::fs;
use std::io::Cursor;
use std::path::Path;

const ENV_VARS: [&str; 7] = [
    "DIARY_RENDER_WORKERS",
    "DIARY_RENDER_QUEUE_DEPTH",
    "DIARY_RENDER_TIMEOUT_MS",
    "DIARY_RENDER_MAX_RETRIES",
    "DIARY_RENDER_BUDGET_MB",
    "DIARY_RENDER_PREFETCH",
    "DIARY_RENDER_SCALE",
];

fn small_page(id: u64) -> PageSnapshot {
    let stroke = Stroke {
        points: vec![Point::new(2.0, 2.0), Point::new(30.0, 20.0)],
        color: Color::BLACK,
        thickness: 2.0,
        tool: StrokeTool::Pen,
    };
    PageSnapshot { page_id: PageId(id), width: 40, height: 30, elements: vec![Element::Stroke(stroke)] }
}

fn write_json(path: &Path, value: &impl serde::Serialize) {
    fs::write(path, serde_json::to_vec(value).expect("serializable")).expect("file should be written");
}

#[test]
fn render_writes_png_file() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let page_path = temp.path().join("page.json");
    let output_path = temp.path().join("out").join("page.png");
    write_json(&page_path, &small_page(1));

    cargo_bin_cmd!("diary-render")
        .arg("render")
        .arg("--page")
        .arg(&page_path)
        .arg("--scale")
        .arg("2")
        .arg("--output")
        .arg(&output_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("page.png"));

    let image = image::open(&output_path).expect("output should be a readable image");
    assert_eq!((image.width(), image.height()), (80, 60));
}

#[test]
fn render_fails_for_invalid_scale() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let page_path = temp.path().join("page.json");
    write_json(&page_path, &small_page(1));

    cargo_bin_cmd!("diary-render")
        .arg("render")
        .arg("--page")
        .arg(&page_path)
        .arg("--scale")
        .arg("0")
        .arg("--output")
        .arg(temp.path().join("page.png"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to render page#1"));
}

#[test]
fn render_fails_for_missing_file() {
    let temp = tempfile::tempdir().expect("temp dir should be created");

    cargo_bin_cmd!("diary-render")
        .arg("render")
        .arg("--page")
        .arg(temp.path().join("missing.json"))
        .arg("--output")
        .arg(temp.path().join("page.png"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read page"));
}

#[test]
fn worker_serves_requests_over_stdio() {
    let mut input = Vec::new();
    let first = RenderRequest::new(7, &small_page(1), Generation(3), 1.0).expect("encodable");
    let second = RenderRequest::new(8, &small_page(2), Generation(1), 0.0).expect("encodable");
    wire::write_request(&mut input, &first).expect("request should encode");
    wire::write_request(&mut input, &second).expect("request should encode");

    let output = cargo_bin_cmd!("diary-render")
        .arg("worker")
        .write_stdin(input)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let mut replies = Cursor::new(output);
    match wire::read_reply(&mut replies).expect("valid reply") {
        Some(RenderReply::Rendered { job_id, bitmap }) => {
            assert_eq!(job_id, 7);
            assert_eq!((bitmap.width, bitmap.height), (40, 30));
        }
        other => panic!("expected a rendered page, got {other:?}"),
    }
    match wire::read_reply(&mut replies).expect("valid reply") {
        Some(RenderReply::Failed { job_id, message }) => {
            assert_eq!(job_id, 8);
            assert!(message.contains("scale"), "unexpected message {message}");
        }
        other => panic!("expected a failure reply, got {other:?}"),
    }
    assert!(wire::read_reply(&mut replies).expect("clean end").is_none());
}

#[test]
fn worker_rejects_garbage_input() {
    cargo_bin_cmd!("diary-render")
        .arg("worker")
        .write_stdin(vec![0xFF, 0xFF, 0xFF, 0x7F, b'{'])
        .assert()
        .failure()
        .stderr(predicate::str::contains("render worker stopped"));
}

#[test]
fn warm_prints_summary() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let notebook_path = temp.path().join("notebook.json");
    let config_path = temp.path().join("render-cache.toml");
    write_json(&notebook_path, &json!({ "pages": [small_page(1), small_page(2), small_page(3)] }));
    fs::write(&config_path, "render_scale = 1.0\n").expect("config should be written");

    let mut cmd = cargo_bin_cmd!("diary-render");
    for var in ENV_VARS {
        cmd.env_remove(var);
    }
    let output = cmd
        .arg("warm")
        .arg("--notebook")
        .arg(&notebook_path)
        .arg("--config")
        .arg(&config_path)
        .arg("--current")
        .arg("2")
        .arg("--workers")
        .arg("2")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value: Value = serde_json::from_slice(&output).expect("stdout should contain valid json");
    assert_eq!(value["current_page"], 2);

    let pages = value["pages"].as_array().expect("pages array");
    assert_eq!(pages.len(), 3);
    for page in pages {
        assert_eq!(page["status"], "rendered", "{page}");
        assert_eq!(page["width"], 40);
        assert_eq!(page["height"], 30);
        assert_eq!(page["generation"], 0);
    }

    let stats = &value["stats"];
    assert_eq!(stats["jobs_submitted"], 3);
    assert_eq!(stats["pinned"], 1);
    assert_eq!(stats["current_size_bytes"], 3 * 40 * 30 * 4);
    assert_eq!(stats["hits"].as_u64().unwrap() + stats["misses"].as_u64().unwrap(), 3);
    assert_eq!(stats["worker_crashes"], 0);
    assert_eq!(stats["degraded"], false);
}

#[test]
fn warm_fails_for_unknown_current_page() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let notebook_path = temp.path().join("notebook.json");
    write_json(&notebook_path, &json!({ "pages": [small_page(1)] }));

    cargo_bin_cmd!("diary-render")
        .arg("warm")
        .arg("--notebook")
        .arg(&notebook_path)
        .arg("--config")
        .arg(temp.path().join("absent.toml"))
        .arg("--current")
        .arg("9")
        .assert()
        .failure()
        .stderr(predicate::str::contains("page#9 is not in the notebook"));
}

#[test]
fn warm_fails_for_empty_notebook() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let notebook_path = temp.path().join("notebook.json");
    write_json(&notebook_path, &json!({ "pages": [] }));

    cargo_bin_cmd!("diary-render")
        .arg("warm")
        .arg("--notebook")
        .arg(&notebook_path)
        .arg("--config")
        .arg(temp.path().join("absent.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("notebook has no pages"));
}
