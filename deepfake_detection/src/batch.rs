use crate::detector::{Detection, DetectionError, Detector};
use futures::StreamExt;
use serde::Serialize;
use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Failed to read directory {path:?}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write report to {path:?}: {source}")]
    WriteReport {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// How a single batch item resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ItemOutcome {
    Detected(Detection),
    Failed { error: String },
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Detected(_))
    }
}

/// Outcome per item path. An item is recorded once and never overwritten.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    items: BTreeMap<PathBuf, ItemOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub label_counts: BTreeMap<String, usize>,
    pub mean_confidence: Option<f32>,
}

impl BatchSummary {
    pub fn log(&self) {
        tracing::info!(
            total = self.total,
            succeeded = self.succeeded,
            failed = self.failed,
            "Batch finished"
        );
        for (label, count) in &self.label_counts {
            tracing::info!("Predicted as {}: {}", label, count);
        }
        if let Some(mean) = self.mean_confidence {
            tracing::info!("Average confidence: {:.3}", mean);
        }
    }
}

impl BatchReport {
    /// Returns `false` and keeps the earlier outcome if `item` was already
    /// resolved.
    pub fn record(&mut self, item: PathBuf, outcome: ItemOutcome) -> bool {
        match self.items.entry(item) {
            Entry::Vacant(entry) => {
                entry.insert(outcome);
                true
            }
            Entry::Occupied(entry) => {
                tracing::warn!("Ignoring second outcome for {:?}", entry.key());
                false
            }
        }
    }

    pub fn get(&self, item: &Path) -> Option<&ItemOutcome> {
        self.items.get(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &ItemOutcome)> {
        self.items.iter()
    }

    pub fn summary(&self) -> BatchSummary {
        let detections: Vec<&Detection> = self
            .items
            .values()
            .filter_map(|outcome| match outcome {
                ItemOutcome::Detected(detection) => Some(detection),
                ItemOutcome::Failed { .. } => None,
            })
            .collect();

        let mut label_counts = BTreeMap::new();
        for detection in &detections {
            *label_counts.entry(detection.label.clone()).or_insert(0) += 1;
        }

        let mean_confidence = (!detections.is_empty()).then(|| {
            detections.iter().map(|detection| detection.confidence).sum::<f32>()
                / detections.len() as f32
        });

        BatchSummary {
            total: self.items.len(),
            succeeded: detections.len(),
            failed: self.items.len() - detections.len(),
            label_counts,
            mean_confidence,
        }
    }

    /// Writes the report and its summary as pretty-printed JSON.
    pub fn save_json(&self, path: &Path) -> Result<(), BatchError> {
        #[derive(Serialize)]
        struct Document<'a> {
            summary: BatchSummary,
            items: &'a BTreeMap<PathBuf, ItemOutcome>,
        }

        let json = serde_json::to_string_pretty(&Document {
            summary: self.summary(),
            items: &self.items,
        })?;
        fs::write(path, json).map_err(|source| BatchError::WriteReport {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!("Results saved to {:?}", path);
        Ok(())
    }
}

/// Runs many items through one shared [`Detector`], isolating failures.
pub struct BatchRunner {
    detector: Arc<Detector>,
    max_concurrency: usize,
}

impl BatchRunner {
    pub fn new(detector: Arc<Detector>, max_concurrency: usize) -> Self {
        Self {
            detector,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Files directly under `dir` whose extension matches one of
    /// `extensions`, ignoring case. Sorted, without duplicates.
    pub fn collect_items(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, BatchError> {
        let read_dir_error = |source| BatchError::ReadDir {
            path: dir.to_path_buf(),
            source,
        };
        let wanted: BTreeSet<String> = extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
            .collect();

        let mut items = BTreeSet::new();
        for entry in fs::read_dir(dir).map_err(read_dir_error)? {
            let path = entry.map_err(read_dir_error)?.path();
            let matches = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| wanted.contains(&ext.to_ascii_lowercase()));
            if matches && path.is_file() {
                items.insert(path);
            }
        }

        Ok(items.into_iter().collect())
    }

    pub async fn run_directory(
        &self,
        dir: &Path,
        extensions: &[String],
    ) -> Result<BatchReport, BatchError> {
        let items = Self::collect_items(dir, extensions)?;
        tracing::info!("Found {} files in {:?}", items.len(), dir);
        if items.is_empty() {
            tracing::warn!("No matching files found in {:?}", dir);
        }

        Ok(self.run(items).await)
    }

    /// Processes every item on the blocking pool, at most `max_concurrency`
    /// at a time. Completion order across items is not preserved.
    pub async fn run(&self, items: Vec<PathBuf>) -> BatchReport {
        let total = items.len();
        let mut outcomes = futures::stream::iter(items)
            .map(|item| {
                let detector = self.detector.clone();
                async move {
                    let path = item.clone();
                    let result = tokio::task::spawn_blocking(move || detector.detect_path(&path))
                        .await
                        .unwrap_or_else(|err| Err(DetectionError::TaskFailed(err.to_string())));
                    let outcome = match result {
                        Ok(detection) => ItemOutcome::Detected(detection),
                        Err(err) => ItemOutcome::Failed {
                            error: err.to_string(),
                        },
                    };
                    (item, outcome)
                }
            })
            .buffer_unordered(self.max_concurrency);

        let mut report = BatchReport::default();
        let mut done = 0;
        while let Some((item, outcome)) = outcomes.next().await {
            done += 1;
            match &outcome {
                ItemOutcome::Detected(detection) => tracing::info!(
                    "[{}/{}] {:?} -> {} (confidence: {:.3})",
                    done,
                    total,
                    item,
                    detection.label,
                    detection.confidence
                ),
                ItemOutcome::Failed { error } => {
                    tracing::error!("[{}/{}] {:?} -> ERROR: {}", done, total, item, error)
                }
            }
            report.record(item, outcome);
        }

        report
    }
}
