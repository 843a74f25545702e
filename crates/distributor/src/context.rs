//! Distributor context
//!
//! Shared, read-only state handed to every component explicitly.

use std::sync::Arc;

use tracing::{info_span, Span};

use crate::config::DistributorConfig;

#[derive(Debug, Clone)]
pub struct DistributorContext {
    pub index: u16,
    pub config: Arc<DistributorConfig>,
}

impl DistributorContext {
    pub fn new(config: DistributorConfig) -> Self {
        Self {
            index: config.distributor.index,
            config: Arc::new(config),
        }
    }

    /// Span tagging a component's logs with this distributor's index
    pub fn span(&self, component: &'static str) -> Span {
        info_span!("distributor", index = self.index, component)
    }
}
