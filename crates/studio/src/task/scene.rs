use std::sync::Arc;

use scenecast_stream::{SceneEvent, SceneKind};
use snafu::OptionExt;

use super::reducer::{MalformedEventSnafu, ReduceResult};
use super::state::Scene;

/// Validated partial update for one scene.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneUpdate {
    pub scene_id: i64,
    pub kind: SceneKind,
    pub url: String,
    pub text: Option<String>,
    pub emotion: Option<String>,
}

impl SceneUpdate {
    pub fn new(scene_id: i64, kind: SceneKind, url: impl Into<String>) -> Self {
        Self {
            scene_id,
            kind,
            url: url.into(),
            text: None,
            emotion: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_emotion(mut self, emotion: impl Into<String>) -> Self {
        self.emotion = Some(emotion.into());
        self
    }
}

impl TryFrom<SceneEvent> for SceneUpdate {
    type Error = super::reducer::ReduceError;

    fn try_from(event: SceneEvent) -> ReduceResult<Self> {
        let scene_id = event.scene_id.context(MalformedEventSnafu {
            stage: "scene-update-id",
            event: "scene",
            field: "scene_id",
        })?;
        let kind = event.kind.context(MalformedEventSnafu {
            stage: "scene-update-kind",
            event: "scene",
            field: "scene_type",
        })?;
        let url = event.url.context(MalformedEventSnafu {
            stage: "scene-update-url",
            event: "scene",
            field: "url",
        })?;

        Ok(Self {
            scene_id,
            kind,
            url,
            text: event.text,
            emotion: event.emotion,
        })
    }
}

/// Merges one partial update into the scene list.
///
/// A new id is appended with only the matching media field set. A known id gets
/// that field overwritten in a fresh entry; every other entry keeps its `Arc`.
pub fn merge(scenes: &[Arc<Scene>], update: &SceneUpdate) -> Vec<Arc<Scene>> {
    let mut merged = scenes.to_vec();

    match merged.iter().position(|scene| scene.id == update.scene_id) {
        Some(index) => {
            let mut scene = Scene::clone(&merged[index]);
            set_media(&mut scene, update);
            merged[index] = Arc::new(scene);
        }
        None => {
            let mut scene = Scene {
                id: update.scene_id,
                text: update.text.clone().unwrap_or_default(),
                emotion: update.emotion.clone().unwrap_or_default(),
                ..Scene::default()
            };
            set_media(&mut scene, update);
            merged.push(Arc::new(scene));
        }
    }

    merged
}

fn set_media(scene: &mut Scene, update: &SceneUpdate) {
    let slot = match update.kind {
        SceneKind::Image => &mut scene.image_url,
        SceneKind::Video => &mut scene.video_url,
    };
    if slot.is_some() {
        tracing::debug!(
            scene_id = update.scene_id,
            kind = ?update.kind,
            "overwriting scene media url"
        );
    }
    *slot = Some(update.url.clone());
}
