//! Builders for creating test data programmatically.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use datasearch::db::dataset_repo::{DatasetRow, NewDataset, EMBEDDING_DIMENSIONS};
use datasearch::enrichment::{
    EnrichmentStage, ExecutorRegistry, FnExecutor, StageExecutor, StageOutcome,
};

/// Builder for `NewDataset` values.
pub struct DatasetBuilder {
    dataset: NewDataset,
}

impl DatasetBuilder {
    pub fn new(source: &str, external_id: &str) -> Self {
        Self {
            dataset: NewDataset::new(
                source,
                external_id,
                format!("Dataset {external_id}"),
                format!("https://{source}.example/{external_id}"),
            ),
        }
    }

    pub fn title(mut self, title: &str) -> Self {
        self.dataset.title = title.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.dataset.description = Some(description.to_string());
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.dataset.tags = Some(tags.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn column_names(mut self, columns: &[&str]) -> Self {
        self.dataset.column_names = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn downloads(mut self, count: i64) -> Self {
        self.dataset.download_count = count;
        self
    }

    pub fn meta(mut self, meta: serde_json::Value) -> Self {
        self.dataset.source_meta = Some(meta);
        self
    }

    pub fn build(self) -> NewDataset {
        self.dataset
    }
}

/// Executor that replays a script of outcomes, then repeats a fallback.
pub struct ScriptedExecutor {
    stage: EnrichmentStage,
    script: Mutex<VecDeque<StageOutcome>>,
    fallback: StageOutcome,
    calls: Arc<AtomicUsize>,
}

impl ScriptedExecutor {
    pub fn new(stage: EnrichmentStage, script: Vec<StageOutcome>, fallback: StageOutcome) -> Self {
        Self {
            stage,
            script: Mutex::new(script.into()),
            fallback,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared call counter, readable after the executor moved into a registry.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl StageExecutor for ScriptedExecutor {
    fn stage(&self) -> EnrichmentStage {
        self.stage
    }

    fn execute(&self, _dataset: &DatasetRow) -> StageOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        script.pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}

/// A registry where every stage succeeds, with realistic artifacts.
pub fn succeeding_registry() -> ExecutorRegistry {
    ExecutorRegistry::new()
        .with(FnExecutor::new(EnrichmentStage::ApiMetadata, |_| {
            StageOutcome::success()
        }))
        .with(FnExecutor::new(EnrichmentStage::Embedding, |d: &DatasetRow| {
            let seed = d.title.len() as f32;
            StageOutcome::success().with_embedding(
                (0..EMBEDDING_DIMENSIONS)
                    .map(|i| (seed + i as f32) / 1000.0)
                    .collect(),
            )
        }))
        .with(FnExecutor::new(EnrichmentStage::StaticScore, |d: &DatasetRow| {
            StageOutcome::success().with_static_score((d.download_count as f64).ln_1p())
        }))
        .with(FnExecutor::new(EnrichmentStage::LinkValidation, |d: &DatasetRow| {
            if d.url.is_empty() {
                StageOutcome::skipped("no url to validate")
            } else {
                StageOutcome::success()
            }
        }))
}

/// Builder for configuration JSON documents.
pub struct ConfigJsonBuilder {
    value: serde_json::Value,
}

impl ConfigJsonBuilder {
    pub fn new() -> Self {
        Self {
            value: serde_json::json!({ "version": "1.0" }),
        }
    }

    pub fn set(mut self, key: &str, value: serde_json::Value) -> Self {
        self.value[key] = value;
        self
    }

    pub fn enrichment(mut self, key: &str, value: serde_json::Value) -> Self {
        if self.value.get("enrichment").is_none() {
            self.value["enrichment"] = serde_json::json!({});
        }
        self.value["enrichment"][key] = value;
        self
    }

    pub fn build(self) -> String {
        serde_json::to_string_pretty(&self.value).unwrap()
    }
}
