use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::async_trait;

use super::{PipelineSink, PipelineStage, StageWorker};
use crate::{exec::ExecFileSystem, operation::OperationContext};

/// Materializes the exec dir of each operation.
pub struct InputFetcher {
    exec: Arc<ExecFileSystem>,
}

impl InputFetcher {
    pub fn new(exec: Arc<ExecFileSystem>) -> Self {
        Self { exec }
    }
}

#[async_trait]
impl StageWorker for InputFetcher {
    type Unit = OperationContext;
    type Error = crate::exec::Error;

    fn name(&self) -> &'static str {
        "input_fetch"
    }

    fn describe(&self, unit: &OperationContext) -> String {
        unit.operation_name().to_string()
    }

    async fn process(
        &self,
        unit: &mut OperationContext,
        cancel: &CancellationToken,
    ) -> Result<(), Self::Error> {
        let exec_dir = self
            .exec
            .create_exec_dir(
                &unit.entry.operation_name,
                unit.entry.index.clone(),
                &unit.entry.action,
                &unit.entry.command,
                cancel,
            )
            .await?;
        unit.exec_dir = Some(exec_dir);
        Ok(())
    }
}

pub type InputFetchStage = PipelineStage<InputFetcher>;

impl InputFetchStage {
    pub fn input_fetch(
        exec: Arc<ExecFileSystem>,
        width: u32,
        output: Arc<dyn PipelineSink<OperationContext>>,
        error: Arc<dyn PipelineSink<OperationContext>>,
    ) -> Self {
        PipelineStage::new(InputFetcher::new(exec), width, output, error)
    }
}
