//! `[[job]]` tables and their conversion into crawl jobs

use crate::document::{DocumentConverter, HtmlConverter, JsonConverter};
use crate::job::{Action, CrawlJob, InterceptRule, OutputRoute};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One crawl job as written in the configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct JobEntry {
    pub url: String,

    #[serde(default, rename = "action")]
    pub actions: Vec<ActionEntry>,

    #[serde(default, rename = "intercept")]
    pub intercepts: Vec<InterceptEntry>,
}

/// A page action, tagged by `type`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ActionEntry {
    Click {
        selector: String,
        #[serde(default, rename = "delay-ms")]
        delay_ms: u64,
    },
    ClickXpath {
        selector: String,
        #[serde(default, rename = "delay-ms")]
        delay_ms: u64,
    },
    Scroll {
        #[serde(rename = "delta-y")]
        delta_y: i64,
        #[serde(default, rename = "delay-ms")]
        delay_ms: u64,
    },
    Evaluate {
        script: String,
        #[serde(default)]
        args: Vec<Value>,
        /// Output the JSON result is published on
        #[serde(default)]
        output: Option<String>,
        #[serde(default)]
        converter: Option<ConverterEntry>,
        #[serde(default, rename = "delay-ms")]
        delay_ms: u64,
    },
}

/// An interception rule: URL pattern plus output route
#[derive(Debug, Clone, Deserialize)]
pub struct InterceptEntry {
    pub pattern: String,

    /// Output channel name; rules sharing a name share a channel
    pub output: String,

    #[serde(default)]
    pub capacity: Option<usize>,

    /// Omitted for observe-only outputs
    #[serde(default)]
    pub converter: Option<ConverterEntry>,
}

/// Document converter declaration, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ConverterEntry {
    Json {
        index: String,
        /// JSON pointer to the array of items; the root when absent
        #[serde(default, rename = "items-pointer")]
        items_pointer: Option<String>,
        #[serde(default, rename = "id-field")]
        id_field: Option<String>,
        #[serde(default, rename = "embedding-fields")]
        embedding_fields: Vec<String>,
    },
    Html {
        index: String,
        #[serde(default)]
        include: Vec<String>,
        #[serde(default)]
        exclude: Vec<String>,
    },
}

impl ConverterEntry {
    pub fn index(&self) -> &str {
        match self {
            Self::Json { index, .. } | Self::Html { index, .. } => index,
        }
    }

    pub fn build(&self) -> Arc<dyn DocumentConverter> {
        match self {
            Self::Json {
                index,
                items_pointer,
                id_field,
                embedding_fields,
            } => {
                let mut converter = JsonConverter::new(index.clone())
                    .with_embedding_fields(embedding_fields.clone());
                if let Some(pointer) = items_pointer {
                    converter = converter.with_items_pointer(pointer.clone());
                }
                if let Some(field) = id_field {
                    converter = converter.with_id_field(field.clone());
                }
                Arc::new(converter)
            }
            Self::Html {
                index,
                include,
                exclude,
            } => Arc::new(HtmlConverter::new(
                index.clone(),
                include.clone(),
                exclude.clone(),
            )),
        }
    }
}

/// Builds crawl jobs from their configuration entries
///
/// Outputs are shared by name across all jobs: every rule naming the same
/// output gets the same route, so the service creates one channel for it.
///
/// # Arguments
///
/// * `entries` - The `[[job]]` entries, already validated
/// * `default_capacity` - Channel capacity for outputs that do not set one
///
/// # Returns
///
/// The jobs in declaration order
pub fn build_jobs(entries: &[JobEntry], default_capacity: usize) -> Vec<CrawlJob> {
    let mut routes: HashMap<String, OutputRoute> = HashMap::new();
    let mut route_for = |name: &str, capacity: Option<usize>, converter: Option<&ConverterEntry>| {
        routes
            .entry(name.to_string())
            .or_insert_with(|| {
                let route = match converter {
                    Some(entry) => OutputRoute::indexed(name, entry.build()),
                    None => OutputRoute::observe(name),
                };
                route.with_capacity(capacity.unwrap_or(default_capacity))
            })
            .clone()
    };

    entries
        .iter()
        .map(|entry| {
            let mut job = CrawlJob::new(entry.url.clone());

            for action in &entry.actions {
                let action = match action {
                    ActionEntry::Click { selector, delay_ms } => {
                        Action::click(selector.clone(), Duration::from_millis(*delay_ms))
                    }
                    ActionEntry::ClickXpath { selector, delay_ms } => {
                        Action::click_xpath(selector.clone(), Duration::from_millis(*delay_ms))
                    }
                    ActionEntry::Scroll { delta_y, delay_ms } => {
                        Action::scroll(*delta_y, Duration::from_millis(*delay_ms))
                    }
                    ActionEntry::Evaluate {
                        script,
                        args,
                        output,
                        converter,
                        delay_ms,
                    } => {
                        let evaluate = Action::evaluate(
                            script.clone(),
                            args.clone(),
                            Duration::from_millis(*delay_ms),
                        );
                        match output {
                            Some(name) => {
                                evaluate.capture_into(route_for(name, None, converter.as_ref()))
                            }
                            None => evaluate,
                        }
                    }
                };
                job = job.with_action(action);
            }

            for intercept in &entry.intercepts {
                let route = route_for(
                    &intercept.output,
                    intercept.capacity,
                    intercept.converter.as_ref(),
                );
                job = job.with_intercept(InterceptRule::new(intercept.pattern.as_str(), route));
            }

            job
        })
        .collect()
}
