use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Fill {
    Red,
    Green,
    Yellow,
    Blue,
    Grey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Ring,
    Dot,
}

/// The small indicator a step shows next to itself. Advisory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub fill: Fill,
    pub shape: Shape,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl NodeStatus {
    pub fn new(fill: Fill, shape: Shape, text: impl Into<String>) -> Self {
        Self { fill, shape, text: text.into(), at: Utc::now() }
    }

    pub fn connecting() -> Self {
        Self::new(Fill::Yellow, Shape::Ring, "connecting")
    }

    pub fn connected() -> Self {
        Self::new(Fill::Green, Shape::Dot, "connected")
    }

    pub fn error(reason: impl fmt::Display) -> Self {
        Self::new(Fill::Red, Shape::Ring, format!("error - {reason}"))
    }

    pub fn idle() -> Self {
        Self::new(Fill::Grey, Shape::Ring, "idle")
    }

    pub fn closed() -> Self {
        Self::new(Fill::Grey, Shape::Ring, "closed")
    }

    /// Same indicator, ignoring when it was set.
    pub fn same_as(&self, other: &NodeStatus) -> bool {
        self.fill == other.fill && self.shape == other.shape && self.text == other.text
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}] {}", self.fill, self.shape, self.text)
    }
}

/// How a step talks back to whatever hosts it.
pub trait StepReporter: Send + Sync + fmt::Debug {
    fn status(&self, step: &str, status: NodeStatus);
    fn warn(&self, step: &str, message: &str);
    fn error(&self, step: &str, message: &str);
}

/// Forwards everything into `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingReporter;

impl StepReporter for TracingReporter {
    fn status(&self, step: &str, status: NodeStatus) {
        info!(%step, fill = %status.fill, shape = %status.shape, "status: {}", status.text);
    }

    fn warn(&self, step: &str, message: &str) {
        warn!(%step, "{message}");
    }

    fn error(&self, step: &str, message: &str) {
        error!(%step, "{message}");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    Status(String, NodeStatus),
    Warn(String, String),
    Error(String, String),
}

/// Keeps every report in memory, then forwards it to tracing.
#[derive(Debug, Default, Clone)]
pub struct RecordingReporter {
    reports: Arc<Mutex<Vec<Report>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, report: Report) {
        match self.reports.lock() {
            Ok(mut reports) => reports.push(report),
            Err(poisoned) => poisoned.into_inner().push(report),
        }
    }

    pub fn reports(&self) -> Vec<Report> {
        match self.reports.lock() {
            Ok(reports) => reports.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn statuses(&self, step: &str) -> Vec<String> {
        self.reports()
            .into_iter()
            .filter_map(|r| match r {
                Report::Status(s, status) if s == step => Some(status.text),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self, step: &str) -> Vec<String> {
        self.reports()
            .into_iter()
            .filter_map(|r| match r {
                Report::Error(s, message) if s == step => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn warnings(&self, step: &str) -> Vec<String> {
        self.reports()
            .into_iter()
            .filter_map(|r| match r {
                Report::Warn(s, message) if s == step => Some(message),
                _ => None,
            })
            .collect()
    }
}

impl StepReporter for RecordingReporter {
    fn status(&self, step: &str, status: NodeStatus) {
        TracingReporter.status(step, status.clone());
        self.push(Report::Status(step.to_string(), status));
    }

    fn warn(&self, step: &str, message: &str) {
        TracingReporter.warn(step, message);
        self.push(Report::Warn(step.to_string(), message.to_string()));
    }

    fn error(&self, step: &str, message: &str) {
        TracingReporter.error(step, message);
        self.push(Report::Error(step.to_string(), message.to_string()));
    }
}
