//! Runs matching handlers against a record, stages their files, applies
//! them and assembles the reply text.

use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::applicator::{ApplyReport, Applicator};
use crate::cache::Cache;
use crate::handler::Output;
use crate::record::{CapabilitySet, ConfigurationRecord};
use crate::registry::HandlerRegistry;

/// Two or more handlers wrote the same destination in one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub path: PathBuf,
    pub handlers: Vec<String>,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Text sent back to the peer.
    pub reply: String,
    /// Handlers whose `produce` ran.
    pub ran: Vec<String>,
    /// Capabilities handed to the applicator.
    pub applied: CapabilitySet,
    pub apply: ApplyReport,
    pub conflicts: Vec<Conflict>,
    /// `(handler, error)` pairs.
    pub failures: Vec<(String, String)>,
}

/// Operator allow-list, optionally narrowed by a request scope.
pub fn allow_list(operator: &CapabilitySet, request: Option<&CapabilitySet>) -> CapabilitySet {
    match request {
        Some(scope) => operator.intersection(scope).cloned().collect(),
        None => operator.clone(),
    }
}

struct Produced {
    handler: String,
    capability: String,
    outputs: Vec<Output>,
}

pub struct Dispatcher<'a> {
    cache: &'a Cache,
    backup: bool,
}

impl<'a> Dispatcher<'a> {
    pub fn new(cache: &'a Cache) -> Self {
        Self {
            cache,
            backup: false,
        }
    }

    pub fn backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }

    pub async fn dispatch(
        &self,
        registry: &mut HandlerRegistry,
        record: &ConfigurationRecord,
        allow: &CapabilitySet,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut produced = Vec::new();

        for handler in registry.iter_mut() {
            let claimed = handler.capabilities();
            let Some(capability) = claimed.intersection(allow).next().cloned() else {
                debug!(handler = %handler.name(), "Not in allow-list");
                continue;
            };
            if !handler.is_runnable(record) {
                debug!(handler = %handler.name(), "Not runnable");
                continue;
            }

            let name = handler.name().to_string();
            info!(handler = %name, capability = %capability, function = %record.function, "Running handler");
            report.ran.push(name.clone());

            match handler.produce(record).await {
                Ok(outputs) => produced.push(Produced {
                    handler: name,
                    capability,
                    outputs,
                }),
                Err(e) => {
                    error!(handler = %name, error = %e, "Handler failed");
                    report.failures.push((name, e.to_string()));
                }
            }
        }

        report.conflicts = find_conflicts(&produced);
        for conflict in &report.conflicts {
            error!(
                path = %conflict.path.display(),
                handlers = ?conflict.handlers,
                "Conflicting outputs, skipping every write to this path"
            );
        }

        let mut messages = Vec::new();
        for item in produced {
            for output in item.outputs {
                match output {
                    Output::Message(text) => messages.push(text),
                    Output::File { path, lines } => {
                        if report.conflicts.iter().any(|c| c.path == path) {
                            continue;
                        }
                        match self.cache.set(&item.capability, &path, &lines) {
                            Ok(()) => {
                                report.applied.insert(item.capability.clone());
                            }
                            Err(e) => {
                                error!(handler = %item.handler, error = %e, "Could not stage output");
                                report.failures.push((item.handler.clone(), e.to_string()));
                            }
                        }
                    }
                }
            }
        }

        match Applicator::new(self.cache)
            .backup(self.backup)
            .apply(&report.applied)
        {
            Ok(apply) => report.apply = apply,
            Err(e) => {
                warn!(error = %e, "Applying staged outputs failed");
                report.failures.push(("applicator".to_string(), e.to_string()));
            }
        }

        report.reply = messages.join("\n");
        report
    }
}

fn find_conflicts(produced: &[Produced]) -> Vec<Conflict> {
    let mut writers: BTreeMap<&PathBuf, Vec<String>> = BTreeMap::new();
    for item in produced {
        for output in &item.outputs {
            if let Output::File { path, .. } = output {
                let names = writers.entry(path).or_default();
                if !names.contains(&item.handler) {
                    names.push(item.handler.clone());
                }
            }
        }
    }
    writers
        .into_iter()
        .filter(|(_, handlers)| handlers.len() > 1)
        .map(|(path, handlers)| Conflict {
            path: path.clone(),
            handlers,
        })
        .collect()
}
