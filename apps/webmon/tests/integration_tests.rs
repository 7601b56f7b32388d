//! End-to-end runs of the scheduler → fetcher → validator chain against a
//! live local server.

mod support;

use std::time::Duration;

use pipeline::{Pipeline, Stage};
use serde_json::json;
use support::{Store, fast_settings, measurements, start_server};
use webmon::Message;
use webmon::stages::{Fetcher, Scheduler, Validator};

#[tokio::test]
async fn pipeline_without_a_database() {
    let server = start_server().await;
    let settings = fast_settings();

    let (store, data) = Store::new();
    let stages: Vec<Box<dyn Stage<Message>>> = vec![
        Box::new(Scheduler::new(settings.clone())),
        Box::new(Fetcher::new(settings.clone())),
        Box::new(Validator::new(settings)),
        Box::new(store),
    ];
    let pipeline = Pipeline::build(stages).unwrap();

    pipeline.put(Message::Reload(vec![
        json!({"url": format!("{server}/http200"), "schedule": 1}),
        json!({"url": format!("{server}/utf16?body=hello"), "schedule": 1, "regex": "hello"}),
    ]));
    tokio::time::sleep(Duration::from_millis(500)).await;
    pipeline.put(Message::Terminal);
    pipeline.wait().await;

    let results = measurements(&data);
    assert!(results.len() >= 2, "expected both targets measured, got {}", results.len());
    assert!(results.iter().all(|m| m.code == Some(200)));
    assert!(results.iter().any(|m| m.status == "completed,regexok"));
    // bodies never travel past the validator
    assert!(results.iter().all(|m| m.body.is_none()));
}

#[tokio::test]
async fn matching_pattern_tags_regexok() {
    let server = start_server().await;
    let settings = fast_settings();

    let (store, data) = Store::new();
    let stages: Vec<Box<dyn Stage<Message>>> = vec![
        Box::new(Scheduler::new(settings.clone())),
        Box::new(Fetcher::new(settings.clone())),
        Box::new(Validator::new(settings)),
        Box::new(store),
    ];
    let pipeline = Pipeline::build(stages).unwrap();

    pipeline.put(Message::Reload(vec![
        json!({"url": format!("{server}/http200"), "schedule": 1, "regex": "success"}),
    ]));
    tokio::time::sleep(Duration::from_millis(500)).await;
    pipeline.put(Message::Terminal);
    pipeline.wait().await;

    let results = measurements(&data);
    let matched = results
        .iter()
        .find(|m| m.code == Some(200) && m.status.contains("completed"))
        .expect("expected a completed measurement");
    assert!(matched.status.contains("regexok"), "status = {}", matched.status);
}

#[tokio::test]
async fn mismatching_pattern_tags_regexfail() {
    let server = start_server().await;
    let settings = fast_settings();

    let (store, data) = Store::new();
    let stages: Vec<Box<dyn Stage<Message>>> = vec![
        Box::new(Scheduler::new(settings.clone())),
        Box::new(Fetcher::new(settings.clone())),
        Box::new(Validator::new(settings)),
        Box::new(store),
    ];
    let pipeline = Pipeline::build(stages).unwrap();

    pipeline.put(Message::Reload(vec![
        json!({"url": format!("{server}/http200"), "schedule": 1, "regex": "absent"}),
    ]));
    tokio::time::sleep(Duration::from_millis(500)).await;
    pipeline.put(Message::Terminal);
    pipeline.wait().await;

    let results = measurements(&data);
    assert!(results.iter().any(|m| m.status == "completed,regexfail"));
}
