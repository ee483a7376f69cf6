use crate::{
    batch::BatchRunner,
    config::Config,
    detector::Detector,
    ort_service::init_runtime,
};
use std::{error::Error, sync::Arc};

pub async fn start_batch(config: Config) -> Result<(), Box<dyn Error>> {
    init_runtime()?;

    let detector = match Detector::from_config(&config.detector) {
        Ok(detector) => Arc::new(detector),
        Err(e) => {
            tracing::error!("Failed to load detection models: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let runner = BatchRunner::new(detector, config.batch.max_concurrency);
    let report = runner
        .run_directory(&config.batch.input_dir, &config.batch.extensions)
        .await?;

    report.summary().log();
    report.save_json(&config.batch.output_file)?;

    Ok(())
}
