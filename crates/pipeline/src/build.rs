use ci_runner::{Result, WorkflowRequest};
use ci_runner_builder::{BuildOutput, ImageBuilder};

/// The build, push and digest steps of a CI run.
#[async_trait::async_trait]
pub trait ImageBuild: Send + Sync {
  async fn build(&self, request: &WorkflowRequest) -> Result<BuildOutput>;

  async fn push(&self, request: &WorkflowRequest, output: &BuildOutput) -> Result<()>;

  async fn digest(&self, request: &WorkflowRequest, output: &BuildOutput) -> Result<String>;
}

#[async_trait::async_trait]
impl ImageBuild for ImageBuilder {
  async fn build(&self, request: &WorkflowRequest) -> Result<BuildOutput> {
    self.build_artifact(request).await
  }

  async fn push(&self, request: &WorkflowRequest, output: &BuildOutput) -> Result<()> {
    ImageBuilder::push(self, request, output).await
  }

  async fn digest(&self, request: &WorkflowRequest, output: &BuildOutput) -> Result<String> {
    self.extract_digest(request, output).await
  }
}
