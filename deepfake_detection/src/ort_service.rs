use crate::{
    classifier::{Classifier, InferenceError, PredictionRecord},
    config::ModelConfig,
    labels::Labels,
};
use ndarray::{ArrayViewD, CowArray, IxDyn};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Failed to load labels from {path:?}: {source}")]
    Labels {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Model has no output named {name:?} (available: {available:?})")]
    UnknownOutput { name: String, available: Vec<String> },
}

fn check_output_name(available: Vec<String>, name: &str) -> Result<(), ModelLoadError> {
    if available.iter().any(|output| output == name) {
        Ok(())
    } else {
        Err(ModelLoadError::UnknownOutput {
            name: name.to_string(),
            available,
        })
    }
}

/// Copies `input` into row-major order only when it is not already.
fn standard_layout<'a>(input: &'a ArrayViewD<'_, f32>) -> CowArray<'a, f32, IxDyn> {
    input.as_standard_layout()
}

/// Initializes the process-wide ONNX Runtime environment. Call once before
/// building any [`OrtClassifier`].
pub fn init_runtime() -> Result<(), ort::Error> {
    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::CUDAExecutionProvider;
        ort::init()
            .with_execution_providers([CUDAExecutionProvider::default().build()])
            .commit()?;
    }
    #[cfg(not(feature = "cuda"))]
    ort::init().commit()?;

    Ok(())
}

/// ONNX Runtime backed classifier.
///
/// Holds `num_instances` sessions of the same model, each behind its own
/// lock. Calls are spread round-robin, so a session is never run by two
/// callers at once while independent sessions work in parallel.
#[derive(Clone)]
pub struct OrtClassifier {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    labels: Arc<Labels>,
    output_name: String,
}

impl OrtClassifier {
    pub fn new(model_config: &ModelConfig) -> Result<Self, ModelLoadError> {
        let labels_path = model_config.get_labels_path();
        let labels = Labels::load(&labels_path).map_err(|source| ModelLoadError::Labels {
            path: labels_path,
            source,
        })?;

        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_path())?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        if let Some(session) = sessions.first() {
            let available = session
                .lock()
                .outputs
                .iter()
                .map(|output| output.name.clone())
                .collect();
            check_output_name(available, &model_config.output_name)?;
        }

        tracing::info!(
            "Created {} ONNX sessions for {:?} ({} labels)",
            num_instances,
            model_config.get_path(),
            labels.len()
        );

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            labels: Arc::new(labels),
            output_name: model_config.output_name.clone(),
        })
    }

    fn run_inference(&self, input: ArrayViewD<'_, f32>) -> Result<Vec<f32>, InferenceError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index].lock();

        tracing::debug!("Running {:?} input on session {}", input.shape(), index);
        let input = standard_layout(&input);
        let tensor_ref = TensorRef::from_array_view(input.view())?;
        let outputs = session.run(ort::inputs![tensor_ref])?;

        let (_shape, data) = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| InferenceError::MissingOutput(self.output_name.clone()))?
            .try_extract_tensor::<f32>()?;

        Ok(data.to_vec())
    }
}

impl Classifier for OrtClassifier {
    fn classify(&self, input: ArrayViewD<'_, f32>) -> Result<PredictionRecord, InferenceError> {
        let scores = self.run_inference(input)?;
        PredictionRecord::from_scores(scores, &self.labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Array2};

    #[test]
    fn test_check_output_name() {
        assert!(check_output_name(vec!["logits".to_string()], "logits").is_ok());

        let err = check_output_name(vec!["logits".to_string(), "pooled".to_string()], "probs").unwrap_err();
        assert!(matches!(
            err,
            ModelLoadError::UnknownOutput { ref name, ref available } if name == "probs" && available.len() == 2
        ));
        assert!(err.to_string().contains("\"probs\""));
    }

    #[test]
    fn test_standard_layout_borrows_contiguous_input() {
        let input = Array::from_shape_vec((1, 2, 3), (0..6).map(|v| v as f32).collect())
            .unwrap()
            .into_dyn();
        let view = input.view();

        let laid_out = standard_layout(&view);

        assert!(laid_out.is_view());
        assert_eq!(laid_out, input);
    }

    #[test]
    fn test_standard_layout_copies_transposed_input() {
        let input = Array2::from_shape_vec((2, 3), vec![0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        let transposed = input.t().into_dyn();
        assert!(!transposed.is_standard_layout());

        let laid_out = standard_layout(&transposed);

        assert!(laid_out.is_owned());
        assert!(laid_out.is_standard_layout());
        assert_eq!(laid_out.shape(), &[3, 2]);
        assert_eq!(laid_out.iter().copied().collect::<Vec<_>>(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }
}
