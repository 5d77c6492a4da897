use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{NotificationIntent, NotificationKind, Recipient};

use super::EngineError;

/// Result of a task transition: the new state plus intents to deliver once committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub task: Task,
    pub unblocked: Option<Task>,
    pub intents: Vec<NotificationIntent>,
}

fn status_label(status: TaskStatus) -> String {
    format!("{status:?}")
}

/// Materialize `specs` as a chain in the given order. The head is Pending
/// unless it waits on something external; every later task starts Blocked.
pub fn build_chain(
    event_id: Ulid,
    specs: &[TaskSpec],
    created_by: Ulid,
) -> Result<(TaskChain, Vec<Task>), EngineError> {
    if specs.is_empty() {
        return Err(EngineError::InvalidInput("task chain needs at least one task"));
    }
    if specs.len() > MAX_TASK_CHAIN_LEN {
        return Err(EngineError::LimitExceeded("task chain too long"));
    }
    if specs.iter().any(|s| s.title.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("task title too long"));
    }

    let chain_id = Ulid::new();
    let tasks: Vec<Task> = specs
        .iter()
        .enumerate()
        .map(|(position, spec)| Task {
            id: Ulid::new(),
            event_id,
            title: spec.title.clone(),
            kind: spec.kind,
            status: if position == 0 && !spec.externally_blocked {
                TaskStatus::Pending
            } else {
                TaskStatus::Blocked
            },
            chain: Some(ChainLink { chain_id, position }),
            assigned_user_id: spec.assigned_user_id,
            created_by,
            trigger_notification: spec.trigger_notification,
            completed_at: None,
            completed_by: None,
            cancel_reason: None,
        })
        .collect();

    let chain = TaskChain {
        id: chain_id,
        event_id,
        task_ids: tasks.iter().map(|t| t.id).collect(),
    };
    Ok((chain, tasks))
}

pub fn start(task: &Task) -> Result<Task, EngineError> {
    if task.status != TaskStatus::Pending {
        return Err(EngineError::InvalidTransition {
            id: task.id,
            from: status_label(task.status),
        });
    }
    let mut started = task.clone();
    started.status = TaskStatus::InProgress;
    Ok(started)
}

/// Complete `task` and unblock `next` if it is waiting on it.
pub fn complete(
    task: &Task,
    next: Option<&Task>,
    now: Ms,
    actor: Ulid,
) -> Result<TaskOutcome, EngineError> {
    if !matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress) {
        return Err(EngineError::InvalidTransition {
            id: task.id,
            from: status_label(task.status),
        });
    }

    let mut done = task.clone();
    done.status = TaskStatus::Completed;
    done.completed_at = Some(now);
    done.completed_by = Some(actor);

    let mut intents = Vec::new();
    let unblocked = match next {
        Some(next) if next.status == TaskStatus::Blocked => {
            let mut ready = next.clone();
            ready.status = TaskStatus::Pending;
            let (recipient, kind) = match ready.assigned_user_id {
                Some(user) => (Recipient::User(user), NotificationKind::TaskReady),
                None => (Recipient::Team, NotificationKind::TaskAvailable),
            };
            intents.push(NotificationIntent {
                recipient,
                kind,
                task_id: ready.id,
                event_id: ready.event_id,
                title: ready.title.clone(),
            });
            Some(ready)
        }
        _ => None,
    };

    if done.trigger_notification {
        intents.push(NotificationIntent {
            recipient: Recipient::User(done.created_by),
            kind: NotificationKind::TaskCompleted,
            task_id: done.id,
            event_id: done.event_id,
            title: done.title.clone(),
        });
    }

    Ok(TaskOutcome {
        task: done,
        unblocked,
        intents,
    })
}

/// Cancel `task`. Its successor stays Blocked.
pub fn cancel(task: &Task, reason: &str) -> Result<Task, EngineError> {
    if matches!(task.status, TaskStatus::Completed | TaskStatus::Cancelled) {
        return Err(EngineError::InvalidTransition {
            id: task.id,
            from: status_label(task.status),
        });
    }
    if reason.len() > MAX_REASON_LEN {
        return Err(EngineError::LimitExceeded("cancel reason too long"));
    }
    let mut cancelled = task.clone();
    cancelled.status = TaskStatus::Cancelled;
    cancelled.cancel_reason = Some(reason.to_string());
    Ok(cancelled)
}
