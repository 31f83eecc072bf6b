use std::sync::Arc;

use tierq_async::{AsyncDispatcher, TOKIO_EXECUTOR};

use crate::{
    HttpRejection, LabelExtractor, PrioritizeLayer, RejectionMapper, ScheduleError,
    default_rejection_mapper,
};

/// Builder for [`PrioritizeLayer`].
pub struct Prioritize {
    executor: String,
    enabled: bool,
    rejection_mapper: RejectionMapper,
}

impl Default for Prioritize {
    fn default() -> Self {
        Self {
            executor: TOKIO_EXECUTOR.to_string(),
            enabled: true,
            rejection_mapper: Arc::new(default_rejection_mapper),
        }
    }
}

impl Prioritize {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor pool the inner service calls are launched on.
    pub fn executor(mut self, name: impl Into<String>) -> Self {
        self.executor = name.into();
        self
    }

    /// Initial state of the runtime switch (see [`PrioritizeLayer::set_enabled`]).
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn rejection_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&ScheduleError) -> HttpRejection + Send + Sync + 'static,
    {
        self.rejection_mapper = Arc::new(mapper);
        self
    }

    /// Builds the layer. `extractor` takes `&Request` and returns the request's
    /// labels, or `None` to let it bypass prioritization.
    pub fn build<Request, K>(
        self,
        dispatcher: AsyncDispatcher,
        extractor: K,
    ) -> PrioritizeLayer<Request, K>
    where
        K: LabelExtractor<Request>,
    {
        PrioritizeLayer::new(
            dispatcher,
            extractor,
            self.executor,
            self.enabled,
            self.rejection_mapper,
        )
    }
}
