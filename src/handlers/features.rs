use async_trait::async_trait;

use crate::error::Result;
use crate::handler::{Handler, Output};
use crate::record::ConfigurationRecord;

/// Hypervisor commands this agent understands.
pub const FEATURES: &str = "password,version,features,agentupdate,resetnetwork";

#[derive(Default)]
pub struct FeaturesHandler;

#[async_trait]
impl Handler for FeaturesHandler {
    fn name(&self) -> &str {
        "FeaturesHandler"
    }

    fn is_runnable(&mut self, record: &ConfigurationRecord) -> bool {
        record.function == "features"
    }

    async fn produce(&mut self, _record: &ConfigurationRecord) -> Result<Vec<Output>> {
        Ok(vec![Output::message(FEATURES)])
    }
}
