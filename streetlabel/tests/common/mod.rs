//! Shared fixtures for the labeling integration tests

#![allow(dead_code)]

use base64::{engine::general_purpose, Engine};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use streetlabel::label::{ApiKeyPool, CompletionTransport, ImageLabeler, LabelJob, TransportResponse};
use streetlabel::{LabelError, PipelineConfig};

type Responder = dyn Fn(&str, usize) -> TransportResponse + Send + Sync;

/// Fake completion endpoint. Test images contain their own id as bytes, so the
/// transport decodes the data URL and answers through `respond(id, call_number)`.
pub struct FakeTransport {
    respond: Box<Responder>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeTransport {
    pub fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&str, usize) -> TransportResponse + Send + Sync + 'static,
    {
        Arc::new(FakeTransport {
            respond: Box::new(respond),
            calls: Mutex::new(HashMap::new()),
        })
    }

    pub fn calls_for(&self, id: &str) -> usize {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

impl CompletionTransport for FakeTransport {
    fn post_json(&self, _api_key: &str, payload: &Value) -> Result<TransportResponse, LabelError> {
        let url = payload
            .pointer("/messages/0/content/1/image_url/url")
            .and_then(Value::as_str)
            .unwrap();
        let encoded = url.strip_prefix("data:image/jpeg;base64,").unwrap();
        let id = String::from_utf8(general_purpose::STANDARD.decode(encoded).unwrap()).unwrap();

        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        Ok((self.respond)(&id, call))
    }
}

pub fn completion(content: &str) -> TransportResponse {
    let body = serde_json::json!({
        "choices": [{"message": {"role": "assistant", "content": content}}]
    });
    TransportResponse::new(200, body.to_string())
}

pub fn test_config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        data_dir: root.join("Data"),
        result_dir: root.join("result"),
        backoff_base_ms: 1,
        key_pause_ms: 0,
        cycle_cooldown_ms: 0,
        workers: 1,
        ..PipelineConfig::default()
    }
}

/// `<root>/images/<name>/<id>.jpg` for every id, each holding its id as bytes
pub fn image_dir(root: &Path, name: &str, ids: &[&str]) -> PathBuf {
    let dir = root.join("images").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    for id in ids {
        std::fs::write(dir.join(format!("{}.jpg", id)), id.as_bytes()).unwrap();
    }
    dir
}

pub fn label_job(dir: &Path, transport: Arc<FakeTransport>, config: &PipelineConfig) -> LabelJob {
    let key_pool = ApiKeyPool::from_config(vec!["key-a".to_string(), "key-b".to_string()], config)
        .unwrap();
    let labeler = ImageLabeler::new(Box::new(transport), config);
    LabelJob::new(dir, "Describe the building.", key_pool, labeler, config)
}

/// Parsed lines of a JSONL file
pub fn read_lines(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}
