use std::sync::Arc;

use crate::config::Config;
use crate::context::Runtime;
use crate::control::JobControl;
use crate::flow::FlowBuilder;
use crate::observability::Metrics;
use crate::progress::ProgressPipeline;
use crate::queue::JobQueue;
use crate::rate_limiter::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: Arc<dyn JobQueue>,
    pub flow: FlowBuilder,
    pub pipeline: ProgressPipeline,
    pub control: JobControl,
    pub limiter: RateLimiter,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            config: runtime.config.clone(),
            queue: runtime.queue.clone(),
            flow: runtime.flow.clone(),
            pipeline: runtime.pipeline.clone(),
            control: runtime.control.clone(),
            limiter: runtime.limiter.clone(),
            metrics: runtime.metrics.clone(),
        }
    }
}
