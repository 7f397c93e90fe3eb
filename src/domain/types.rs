//! Shared domain enumerations aligned with persisted column values.

use serde::{Deserialize, Serialize};

/// Lifecycle of a persisted invalidation task.
///
/// `Done` rows are purged by the worker's maintenance loop, so `Dead` is the
/// only state a task can rest in indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Scheduled,
    Running,
    Retrying,
    Dead,
    Done,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Scheduled => "scheduled",
            TaskState::Running => "running",
            TaskState::Retrying => "retrying",
            TaskState::Dead => "dead",
            TaskState::Done => "done",
        }
    }
}

impl TryFrom<&str> for TaskState {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(TaskState::Pending),
            "scheduled" => Ok(TaskState::Scheduled),
            "running" => Ok(TaskState::Running),
            "retrying" => Ok(TaskState::Retrying),
            "dead" => Ok(TaskState::Dead),
            "done" => Ok(TaskState::Done),
            _ => Err(()),
        }
    }
}

/// Counter columns on an article that are bumped at most once per actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleCounter {
    Likes,
    Views,
}

impl ArticleCounter {
    pub fn as_str(self) -> &'static str {
        match self {
            ArticleCounter::Likes => "likes",
            ArticleCounter::Views => "views",
        }
    }
}
