use std::sync::{Arc, Mutex};

use multimodal_search::config::SearchConfig;
use multimodal_search::model::types::{ContentFragment, EmbeddingMode};

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: Arc<Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}

/// Small-dimension config with the given embedding mode and no cache dir.
#[allow(dead_code)]
pub fn test_config(mode: EmbeddingMode) -> SearchConfig {
    let mut config = SearchConfig::default();
    config.embedding.mode = mode;
    config.embedding.batch_size = 4;
    config.vector.dimension = 64;
    config
}

/// The three-fragment scenario corpus.
#[allow(dead_code)]
pub fn scenario_corpus() -> Vec<ContentFragment> {
    vec![
        ContentFragment::new("frag-0", "text", "sales rose 15%"),
        ContentFragment::new("frag-1", "text", "engineering manager announcement"),
        ContentFragment::new("frag-2", "text", "system latency improved 30%"),
    ]
}

/// Mixed Japanese/English report fragments.
#[allow(dead_code)]
pub fn report_corpus() -> Vec<ContentFragment> {
    vec![
        ContentFragment::new("r0", "text", "第3四半期の売上高は前年比15%増の12億円となりました")
            .with_metadata("section", "financials"),
        ContentFragment::new("r1", "table", "営業部 売上 Q3 2024 1,200百万円")
            .with_metadata("section", "financials"),
        ContentFragment::new("r2", "text", "株式会社サンプルは新しいエンジニアリング部長を任命しました"),
        ContentFragment::new("r3", "text", "system latency improved 30% in FY2024"),
        ContentFragment::new("r4", "heading", "Quarterly revenue summary"),
        ContentFragment::new("r5", "text", "engineering manager announcement for the platform team"),
    ]
}

/// Writes `fragments` as JSONL.
#[allow(dead_code)]
pub fn write_jsonl(path: &std::path::Path, fragments: &[ContentFragment]) {
    let body: String = fragments
        .iter()
        .map(|f| serde_json::to_string(f).unwrap() + "\n")
        .collect();
    std::fs::write(path, body).unwrap();
}
