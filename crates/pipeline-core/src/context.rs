//! Run-scoped evaluation context.
//!
//! A [`RunContext`] tracks the live status of one run and its children,
//! exposes that state to condition/template expressions, and snapshots
//! into a [`Run`] document for persistence.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::expr;
use crate::types::{
    Flow, InlineRun, InlineStepState, JsonMap, Run, RunId, RunStatus, SpecRun, SpecState,
};
use crate::value::{map, Value};

/// Mutable evaluation context for a single run.
#[derive(Debug, Clone)]
pub struct RunContext {
    flow_id: String,
    flow_kind: String,
    namespace: String,
    run_id: RunId,
    status: RunStatus,
    trigger: String,
    create_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,

    specifications: Vec<SpecState>,
    spec_index: HashMap<String, usize>,

    inline: Option<InlineContext>,

    /// The merged variable map, wrapped under the `var` key.
    variables: JsonMap,
}

#[derive(Debug, Clone)]
struct InlineContext {
    id: String,
    steps: Vec<InlineStepState>,
    // Step id to index; avoids scanning the step list on every update.
    step_index: HashMap<String, usize>,
}

impl RunContext {
    pub fn new(run_id: RunId, trigger: impl Into<String>, flow: &Flow, variables: JsonMap) -> Self {
        let mut specifications = Vec::with_capacity(flow.specification.len());
        let mut spec_index = HashMap::with_capacity(flow.specification.len());

        for (i, spec) in flow.specification.iter().enumerate() {
            spec_index.insert(spec.id.clone(), i);
            specifications.push(SpecState {
                id: spec.id.clone(),
                nomad_job_id: String::new(),
                nomad_job_namespace: String::new(),
                status: RunStatus::Pending,
                start_time: None,
                end_time: None,
            });
        }

        let inline = flow.inline.as_ref().map(|inline| {
            let mut steps = Vec::with_capacity(inline.steps.len());
            let mut step_index = HashMap::with_capacity(inline.steps.len());
            for (i, step) in inline.steps.iter().enumerate() {
                step_index.insert(step.id.clone(), i);
                steps.push(InlineStepState {
                    id: step.id.clone(),
                    status: RunStatus::Pending,
                    exit_code: -1,
                    start_time: None,
                    end_time: None,
                });
            }
            InlineContext {
                id: inline.id.clone(),
                steps,
                step_index,
            }
        });

        Self {
            flow_id: flow.id.clone(),
            flow_kind: flow
                .kind()
                .map_or_else(|| "unknown".to_string(), |k| k.as_str().to_string()),
            namespace: flow.namespace.clone(),
            run_id,
            status: RunStatus::Pending,
            trigger: trigger.into(),
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            specifications,
            spec_index,
            inline,
            variables,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    // --- Lifecycle transitions ---

    pub fn start_run(&mut self) {
        self.status = RunStatus::Running;
        self.start_time = Some(Utc::now());
    }

    pub fn end_run(&mut self, status: RunStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
    }

    pub fn start_specification(&mut self, spec_id: &str, job_namespace: &str, job_id: &str) {
        if let Some(&idx) = self.spec_index.get(spec_id) {
            let spec = &mut self.specifications[idx];
            spec.status = RunStatus::Running;
            spec.start_time = Some(Utc::now());
            spec.nomad_job_id = job_id.to_string();
            spec.nomad_job_namespace = job_namespace.to_string();
        }
    }

    /// A skipped specification never started, so it keeps zero times.
    pub fn end_specification(&mut self, spec_id: &str, status: RunStatus) {
        if let Some(&idx) = self.spec_index.get(spec_id) {
            let spec = &mut self.specifications[idx];
            spec.status = status;
            if status != RunStatus::Skipped {
                spec.end_time = Some(Utc::now());
            }
        }
    }

    pub fn start_inline_step(&mut self, step_id: &str) {
        if let Some(inline) = &mut self.inline {
            if let Some(&idx) = inline.step_index.get(step_id) {
                let step = &mut inline.steps[idx];
                step.status = RunStatus::Running;
                step.start_time = Some(Utc::now());
            }
        }
    }

    /// A skipped step never started, so it keeps zero times.
    pub fn end_inline_step(&mut self, step_id: &str, status: RunStatus, exit_code: i32) {
        if let Some(inline) = &mut self.inline {
            if let Some(&idx) = inline.step_index.get(step_id) {
                let step = &mut inline.steps[idx];
                step.status = status;
                step.exit_code = exit_code;
                if status != RunStatus::Skipped {
                    step.end_time = Some(Utc::now());
                }
            }
        }
    }

    /// Mark every child still pending as skipped. Applied before a run
    /// terminates early so terminal runs only ever hold terminal children.
    pub fn skip_pending_children(&mut self) {
        for spec in &mut self.specifications {
            if spec.status == RunStatus::Pending {
                spec.status = RunStatus::Skipped;
            }
        }
        if let Some(inline) = &mut self.inline {
            for step in &mut inline.steps {
                if step.status == RunStatus::Pending {
                    step.status = RunStatus::Skipped;
                }
            }
        }
    }

    // --- Expression evaluation ---

    pub fn eval_bool(&self, src: &str) -> expr::Result<bool> {
        expr::eval_bool(src, &self.as_value())
    }

    pub fn eval_template(&self, src: &str) -> expr::Result<String> {
        expr::eval_template(src, &self.as_value())
    }

    /// Build the variable tree visible to expressions.
    pub fn as_value(&self) -> Value {
        let mut root = Vec::new();

        root.push((
            "nomad_pipeline".to_string(),
            map([
                ("flow_id".to_string(), Value::from(self.flow_id.as_str())),
                ("flow_type".to_string(), Value::from(self.flow_kind.as_str())),
                ("namespace".to_string(), Value::from(self.namespace.as_str())),
                ("run_id".to_string(), Value::from(self.run_id.to_string())),
                ("status".to_string(), Value::from(self.status.as_str())),
                ("trigger".to_string(), Value::from(self.trigger.as_str())),
                (
                    "create_time".to_string(),
                    Value::from(format_time(Some(self.create_time))),
                ),
                (
                    "start_time".to_string(),
                    Value::from(format_time(self.start_time)),
                ),
                (
                    "end_time".to_string(),
                    Value::from(format_time(self.end_time)),
                ),
            ]),
        ));

        if !self.specifications.is_empty() {
            let specs = self
                .specifications
                .iter()
                .map(|spec| (spec.id.clone(), spec_as_value(spec)))
                .collect::<Vec<_>>();
            root.push(("specifications".to_string(), map(specs)));
        }

        if let Some(inline) = &self.inline {
            let steps = inline
                .steps
                .iter()
                .map(|step| (step.id.clone(), step_as_value(step)))
                .collect::<Vec<_>>();
            root.push((
                "inline".to_string(),
                map([
                    ("id".to_string(), Value::from(inline.id.as_str())),
                    ("steps".to_string(), map(steps)),
                ]),
            ));
        }

        let vars = self
            .variables
            .get("var")
            .map(Value::from)
            .unwrap_or_else(|| map([]));
        root.push(("var".to_string(), vars));

        map(root)
    }

    /// Snapshot the context into a persistable run document.
    ///
    /// The `trigger.*` sub-map produced by webhooks is flattened into
    /// dotted keys so the stored variables stay a single-level map.
    pub fn run(&self) -> Run {
        let mut variables = JsonMap::new();

        if let Some(serde_json::Value::Object(vars)) = self.variables.get("var") {
            for (key, value) in vars {
                match value {
                    serde_json::Value::Object(nested) if key == "trigger" => {
                        for (sub_key, sub_value) in nested {
                            variables.insert(format!("{key}.{sub_key}"), sub_value.clone());
                        }
                    }
                    _ => {
                        variables.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        let spec_run = if self.specifications.is_empty() {
            None
        } else {
            Some(SpecRun {
                specs: self.specifications.clone(),
            })
        };

        let inline_run = self.inline.as_ref().map(|inline| InlineRun {
            id: inline.id.clone(),
            steps: inline.steps.clone(),
        });

        Run {
            id: self.run_id.clone(),
            namespace: self.namespace.clone(),
            flow_id: self.flow_id.clone(),
            status: self.status,
            trigger: self.trigger.clone(),
            create_time: self.create_time,
            start_time: self.start_time,
            end_time: self.end_time,
            variables,
            inline_run,
            spec_run,
        }
    }
}

fn spec_as_value(spec: &SpecState) -> Value {
    let mut entries = vec![
        ("id".to_string(), Value::from(spec.id.as_str())),
        ("status".to_string(), Value::from(spec.status.as_str())),
        (
            "start_time".to_string(),
            Value::from(format_time(spec.start_time)),
        ),
        (
            "end_time".to_string(),
            Value::from(format_time(spec.end_time)),
        ),
    ];
    if !spec.nomad_job_id.is_empty() {
        entries.push((
            "nomad_job_id".to_string(),
            Value::from(spec.nomad_job_id.as_str()),
        ));
    }
    if !spec.nomad_job_namespace.is_empty() {
        entries.push((
            "nomad_job_namespace".to_string(),
            Value::from(spec.nomad_job_namespace.as_str()),
        ));
    }
    map(entries)
}

fn step_as_value(step: &InlineStepState) -> Value {
    map([
        ("id".to_string(), Value::from(step.id.as_str())),
        ("status".to_string(), Value::from(step.status.as_str())),
        ("exit_code".to_string(), Value::Int(i64::from(step.exit_code))),
        (
            "start_time".to_string(),
            Value::from(format_time(step.start_time)),
        ),
        (
            "end_time".to_string(),
            Value::from(format_time(step.end_time)),
        ),
    ])
}

/// Zero (absent) times render as the empty string.
fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}
