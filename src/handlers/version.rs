use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::info;

use crate::error::Result;
use crate::handler::{Handler, Output};
use crate::record::ConfigurationRecord;
use crate::AGENT_VERSION;

/// Answers version queries. `arguments` names the component; unknown
/// names fall back to the agent version, no name returns the table.
#[derive(Default)]
pub struct VersionHandler;

fn versions() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([("agent", AGENT_VERSION), ("guestlink", AGENT_VERSION)])
}

#[async_trait]
impl Handler for VersionHandler {
    fn name(&self) -> &str {
        "VersionHandler"
    }

    fn is_runnable(&mut self, record: &ConfigurationRecord) -> bool {
        if record.function != "version" {
            info!("Must be passed \"version\" as the function");
            return false;
        }
        true
    }

    async fn produce(&mut self, record: &ConfigurationRecord) -> Result<Vec<Output>> {
        let table = versions();
        let message = match record.arguments.as_deref() {
            Some(component) => table
                .get(component)
                .copied()
                .unwrap_or(AGENT_VERSION)
                .to_string(),
            None => format!("versions: {}", serde_json::to_string(&table)?),
        };
        Ok(vec![Output::message(message)])
    }
}
