use scenecast_stream::{CancelHandle, ScriptDraft, StreamEvent};
use snafu::{OptionExt, Snafu, ensure};

use super::scene::{SceneUpdate, merge};
use super::state::{CANCELLED_MESSAGE, Phase, PipelineStage, ScriptEntry, TaskState};

pub type ReduceResult<T> = Result<T, ReduceError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ReduceError {
    #[snafu(display("malformed '{event}' event: missing or invalid `{field}`"))]
    MalformedEvent {
        stage: &'static str,
        event: &'static str,
        field: &'static str,
    },
}

/// Validated input to [`reduce`].
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Init {
        remote_task_id: String,
    },
    Progress {
        value: f64,
        /// `None` when the remote sent no stage or one this build does not know.
        stage: Option<PipelineStage>,
    },
    WritingDone {
        script: Vec<ScriptEntry>,
    },
    Scene(SceneUpdate),
    Done {
        final_video_url: String,
    },
    Error {
        message: String,
    },
    /// Raised locally by the user, never by the stream.
    Cancel,
}

impl TaskEvent {
    /// Synthetic failure standing in for an event that could not be used.
    pub fn malformed(details: impl std::fmt::Display) -> Self {
        Self::Error {
            message: format!("malformed event: {details}"),
        }
    }
}

impl TryFrom<StreamEvent> for TaskEvent {
    type Error = ReduceError;

    fn try_from(event: StreamEvent) -> ReduceResult<Self> {
        match event {
            StreamEvent::Init(init) => {
                let remote_task_id = init.remote_task_id.context(MalformedEventSnafu {
                    stage: "task-event-init",
                    event: "init",
                    field: "task_id",
                })?;
                Ok(Self::Init { remote_task_id })
            }
            StreamEvent::Progress(progress) => {
                let value = progress.value.context(MalformedEventSnafu {
                    stage: "task-event-progress",
                    event: "progress",
                    field: "progress",
                })?;
                ensure!(
                    value.is_finite(),
                    MalformedEventSnafu {
                        stage: "task-event-progress-finite",
                        event: "progress",
                        field: "progress",
                    }
                );
                let stage = progress.stage.as_deref().and_then(|raw| {
                    let parsed = PipelineStage::parse(raw);
                    if parsed.is_none() {
                        tracing::debug!(stage = %raw, "ignoring unknown pipeline stage");
                    }
                    parsed
                });
                Ok(Self::Progress {
                    value: value.clamp(0.0, 1.0),
                    stage,
                })
            }
            StreamEvent::WritingDone(writing) => {
                let drafts = writing.scenes_draft.context(MalformedEventSnafu {
                    stage: "task-event-writing-done",
                    event: "writing_done",
                    field: "scenes",
                })?;
                Ok(Self::WritingDone {
                    script: script_from_drafts(drafts),
                })
            }
            StreamEvent::Scene(scene) => SceneUpdate::try_from(scene).map(Self::Scene),
            StreamEvent::Done(done) => {
                let final_video_url = done.final_video_url.context(MalformedEventSnafu {
                    stage: "task-event-done",
                    event: "done",
                    field: "final_video_url",
                })?;
                Ok(Self::Done { final_video_url })
            }
            StreamEvent::Error(error) => {
                let message = error.message.context(MalformedEventSnafu {
                    stage: "task-event-error",
                    event: "error",
                    field: "message",
                })?;
                Ok(Self::Error { message })
            }
        }
    }
}

// Drafts without an id take their 1-based position, as the remote numbers scenes.
fn script_from_drafts(drafts: Vec<ScriptDraft>) -> Vec<ScriptEntry> {
    drafts
        .into_iter()
        .enumerate()
        .map(|(index, draft)| ScriptEntry {
            id: draft.id.unwrap_or(index as i64 + 1),
            text: draft.text,
            kind: draft.kind,
            emotion: draft.emotion,
        })
        .collect()
}

/// Output of one reducer step.
#[derive(Debug)]
pub struct Reduction {
    pub state: TaskState,
    /// Set exactly once, on the step that made the task terminal.
    pub released: Option<CancelHandle>,
}

impl Reduction {
    fn unchanged(state: TaskState) -> Self {
        Self {
            state,
            released: None,
        }
    }
}

/// Applies one event to a task.
///
/// Events whose precondition does not hold, and every event after a terminal
/// phase, leave the state as it was.
pub fn reduce(mut state: TaskState, event: TaskEvent) -> Reduction {
    if state.phase.is_terminal() {
        return Reduction::unchanged(state);
    }

    match event {
        TaskEvent::Init { remote_task_id } => {
            if state.phase == Phase::Init {
                state.remote_task_id = Some(remote_task_id);
            }
            Reduction::unchanged(state)
        }
        TaskEvent::Progress { value, stage } => {
            state.progress = state.progress.max(value);
            if let Some(stage) = stage {
                state.stage = state.stage.max(stage);
                state.phase = state.phase.max(stage.phase());
            }
            Reduction::unchanged(state)
        }
        TaskEvent::WritingDone { script } => {
            if matches!(state.phase, Phase::Init | Phase::Writing) {
                state.script = script;
                state.phase = Phase::Rendering;
                state.stage = state.stage.max(PipelineStage::Imaging);
            }
            Reduction::unchanged(state)
        }
        TaskEvent::Scene(mut update) => {
            if matches!(state.phase, Phase::Writing | Phase::Rendering) {
                fill_from_script(&state, &mut update);
                state.scenes = merge(&state.scenes, &update);
            }
            Reduction::unchanged(state)
        }
        TaskEvent::Done { final_video_url } => {
            state.final_video_url = Some(final_video_url);
            state.progress = 1.0;
            state.stage = PipelineStage::Done;
            finish(state, Phase::Done)
        }
        TaskEvent::Error { message } => {
            state.error_message = Some(message);
            finish(state, Phase::Errored)
        }
        TaskEvent::Cancel => {
            state.error_message = Some(CANCELLED_MESSAGE.to_string());
            finish(state, Phase::Cancelled)
        }
    }
}

fn finish(mut state: TaskState, phase: Phase) -> Reduction {
    state.phase = phase;
    let released = state.cancel.take();
    Reduction { state, released }
}

// Only a first-seen scene takes text from the script; known scenes keep theirs.
fn fill_from_script(state: &TaskState, update: &mut SceneUpdate) {
    if state.scene(update.scene_id).is_some() {
        return;
    }
    let Some(entry) = state.script.iter().find(|entry| entry.id == update.scene_id) else {
        return;
    };
    if update.text.is_none() {
        update.text = Some(entry.text.clone());
    }
    if update.emotion.is_none() {
        update.emotion = Some(entry.emotion.clone());
    }
}

#[cfg(test)]
mod tests {
    use scenecast_storage::MessageId;
    use scenecast_stream::{ProgressEvent, SceneKind};

    use super::*;
    use crate::task::state::Scene;

    fn live_task() -> (TaskState, tokio::sync::oneshot::Receiver<()>) {
        let (cancel, cancel_rx) = CancelHandle::pair();
        (TaskState::live(MessageId::new_v7(), "测试", cancel), cancel_rx)
    }

    fn feed(state: TaskState, events: Vec<StreamEvent>) -> TaskState {
        events.into_iter().fold(state, |state, event| {
            let event = TaskEvent::try_from(event).expect("test events are well formed");
            reduce(state, event).state
        })
    }

    fn scenario_events() -> Vec<StreamEvent> {
        vec![
            StreamEvent::init("t1"),
            StreamEvent::progress(0.1, "writing"),
            StreamEvent::writing_done(vec![ScriptDraft::new(1, "a", "x", "y")]),
            StreamEvent::scene(1, SceneKind::Image, "u1"),
            StreamEvent::scene(1, SceneKind::Video, "u2"),
            StreamEvent::done("final.mp4"),
        ]
    }

    #[test]
    fn full_run_reaches_done() {
        let (state, _cancel_rx) = live_task();
        let state = feed(state, scenario_events());

        assert_eq!(state.phase, Phase::Done);
        assert_eq!(state.progress, 1.0);
        assert_eq!(state.remote_task_id.as_deref(), Some("t1"));
        assert_eq!(state.script, vec![ScriptEntry::new(1, "a", "x", "y")]);
        assert_eq!(state.scenes.len(), 1);
        assert_eq!(
            *state.scenes[0],
            Scene {
                id: 1,
                text: "a".to_string(),
                kind: String::new(),
                emotion: "y".to_string(),
                image_url: Some("u1".to_string()),
                video_url: Some("u2".to_string()),
            }
        );
        assert_eq!(state.final_video_url.as_deref(), Some("final.mp4"));
        assert_eq!(state.error_message, None);
        assert!(!state.is_cancelable());
    }

    #[test]
    fn progress_never_decreases() {
        let (mut state, _cancel_rx) = live_task();
        let mut observed = Vec::new();
        for value in [0.3, 0.1, 0.5, 0.2, 0.5, 0.9, 0.0] {
            state = reduce(
                state,
                TaskEvent::Progress {
                    value,
                    stage: None,
                },
            )
            .state;
            observed.push(state.progress);
        }

        assert!(observed.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(observed.last().copied(), Some(0.9));
    }

    #[test]
    fn phase_and_stage_only_move_forward() {
        let (state, _cancel_rx) = live_task();
        let state = feed(
            state,
            vec![
                StreamEvent::progress(0.4, "imaging"),
                StreamEvent::progress(0.5, "writing"),
                StreamEvent::progress(0.6, "teleporting"),
            ],
        );

        assert_eq!(state.phase, Phase::Rendering);
        assert_eq!(state.stage, PipelineStage::Imaging);
        assert_eq!(state.progress, 0.6);
    }

    #[test]
    fn finished_script_moves_the_stage_into_rendering() {
        let (state, _cancel_rx) = live_task();
        let state = feed(
            state,
            vec![
                StreamEvent::progress(0.2, "writing"),
                StreamEvent::writing_done(vec![ScriptDraft::new(1, "a", "x", "y")]),
            ],
        );
        assert_eq!(state.phase, Phase::Rendering);
        assert_eq!(state.stage, PipelineStage::Imaging);
        assert_eq!(state.status_line(), "20% Generating scene images...");

        let (state, _cancel_rx) = live_task();
        let state = feed(
            state,
            vec![
                StreamEvent::progress(0.7, "composing"),
                StreamEvent::writing_done(Vec::new()),
            ],
        );
        assert_eq!(state.stage, PipelineStage::Composing);
    }

    #[test]
    fn init_after_writing_started_is_ignored() {
        let (state, _cancel_rx) = live_task();
        let state = feed(
            state,
            vec![
                StreamEvent::progress(0.1, "writing"),
                StreamEvent::init("late"),
            ],
        );
        assert_eq!(state.remote_task_id, None);
    }

    #[test]
    fn scenes_before_writing_are_ignored() {
        let (state, _cancel_rx) = live_task();
        let state = feed(state, vec![StreamEvent::scene(1, SceneKind::Image, "u1")]);
        assert!(state.scenes.is_empty());
    }

    #[test]
    fn terminal_states_ignore_everything() {
        let (state, _cancel_rx) = live_task();
        let done = feed(state, scenario_events());
        let before = done.snapshot();

        let after = feed(
            done,
            vec![
                StreamEvent::done("other.mp4"),
                StreamEvent::error("late failure"),
                StreamEvent::scene(2, SceneKind::Image, "u9"),
                StreamEvent::progress(0.2, "imaging"),
            ],
        );
        let after = reduce(after, TaskEvent::Cancel);

        assert!(after.released.is_none());
        assert_eq!(after.state, before);
    }

    #[test]
    fn handle_is_released_once_on_terminal_transition() {
        let (state, mut cancel_rx) = live_task();
        let first = reduce(
            state,
            TaskEvent::Error {
                message: "boom".to_string(),
            },
        );
        assert_eq!(first.state.phase, Phase::Errored);
        assert!(first.released.is_some());

        let second = reduce(first.state, TaskEvent::Cancel);
        assert!(second.released.is_none());
        assert_eq!(second.state.error_message.as_deref(), Some("boom"));

        drop(first.released);
        assert_eq!(cancel_rx.try_recv(), Ok(()));
    }

    #[test]
    fn cancel_after_writing_freezes_scenes() {
        let (state, mut cancel_rx) = live_task();
        let events = scenario_events();
        let state = feed(state, events[..3].to_vec());

        let Reduction {
            state,
            released,
        } = reduce(state, TaskEvent::Cancel);
        let mut released = released.expect("cancel releases the handle");
        assert!(released.abort());
        assert_eq!(cancel_rx.try_recv(), Ok(()));

        let state = feed(state, events[3..].to_vec());
        assert_eq!(state.phase, Phase::Cancelled);
        assert_eq!(state.error_message.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(state.scenes.is_empty());
        assert_eq!(state.final_video_url, None);
    }

    #[test]
    fn missing_required_fields_are_malformed() {
        let error = TaskEvent::try_from(StreamEvent::Done(Default::default())).unwrap_err();
        assert!(matches!(
            error,
            ReduceError::MalformedEvent {
                field: "final_video_url",
                ..
            }
        ));

        let error = TaskEvent::try_from(StreamEvent::Progress(ProgressEvent {
            value: Some(f64::NAN),
            stage: Some("writing".to_string()),
            message: None,
        }))
        .unwrap_err();
        assert!(matches!(
            error,
            ReduceError::MalformedEvent {
                field: "progress",
                ..
            }
        ));
    }

    #[test]
    fn drafts_without_ids_are_numbered_by_position() {
        let event = StreamEvent::writing_done(vec![
            ScriptDraft {
                id: None,
                text: "first".to_string(),
                ..ScriptDraft::default()
            },
            ScriptDraft {
                id: None,
                text: "second".to_string(),
                ..ScriptDraft::default()
            },
        ]);
        let TaskEvent::WritingDone { script } = TaskEvent::try_from(event).unwrap() else {
            panic!("expected writing_done");
        };
        assert_eq!(
            script.iter().map(|entry| entry.id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }
}
