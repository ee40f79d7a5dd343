pub mod gateway;
pub mod pipeline;

pub use gateway::{ChatGateway, ChatOutcome, ChatTransport, GatewayError, HttpTransport};
pub use pipeline::{
    CancelToken, GenerateOptions, GenerationPipeline, GenerationReport, PipelineError,
};
