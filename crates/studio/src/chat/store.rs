use std::collections::HashMap;

use scenecast_storage::MessageId;
use snafu::{OptionExt, Snafu, ensure};

use super::message::{ConversationMessage, MessagePatch};
use crate::task::TaskState;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("message '{message_id}' already exists in the conversation"))]
    DuplicateMessage {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display("message '{message_id}' is not in the conversation"))]
    UnknownMessage {
        stage: &'static str,
        message_id: MessageId,
    },
}

/// Ordered conversation with by-id replacement.
#[derive(Debug, Default)]
pub struct ConversationStore {
    messages: Vec<ConversationMessage>,
    positions: HashMap<MessageId, usize>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A conversation that opens with a single message.
    pub fn starting_with(message: ConversationMessage) -> Self {
        Self {
            positions: HashMap::from([(message.id, 0)]),
            messages: vec![message],
        }
    }

    /// Builds a store from an ordered list, rejecting repeated ids.
    pub fn from_messages(messages: Vec<ConversationMessage>) -> StoreResult<Self> {
        let mut store = Self::new();
        for message in messages {
            store.append(message)?;
        }
        Ok(store)
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, message_id: MessageId) -> Option<&ConversationMessage> {
        self.positions
            .get(&message_id)
            .map(|position| &self.messages[*position])
    }

    pub fn task(&self, message_id: MessageId) -> Option<&TaskState> {
        self.get(message_id)
            .and_then(|message| message.task.as_ref())
    }

    pub fn append(&mut self, message: ConversationMessage) -> StoreResult<()> {
        ensure!(
            !self.positions.contains_key(&message.id),
            DuplicateMessageSnafu {
                stage: "conversation-append",
                message_id: message.id,
            }
        );

        self.positions.insert(message.id, self.messages.len());
        self.messages.push(message);
        Ok(())
    }

    pub fn update_message(&mut self, message_id: MessageId, patch: MessagePatch) -> StoreResult<()> {
        let message = self.message_mut(message_id, "conversation-update")?;
        if let Some(content) = patch.content {
            message.content = content;
        }
        if let Some(task) = patch.task {
            message.task = Some(task);
        }
        Ok(())
    }

    /// Moves the task out so the reducer can own it for one step.
    pub(crate) fn take_task(&mut self, message_id: MessageId) -> StoreResult<Option<TaskState>> {
        let message = self.message_mut(message_id, "conversation-take-task")?;
        Ok(message.task.take())
    }

    fn message_mut(
        &mut self,
        message_id: MessageId,
        stage: &'static str,
    ) -> StoreResult<&mut ConversationMessage> {
        let position = self
            .positions
            .get(&message_id)
            .copied()
            .context(UnknownMessageSnafu { stage, message_id })?;
        Ok(&mut self.messages[position])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Role;
    use crate::task::Phase;

    #[test]
    fn keeps_insertion_order() {
        let mut store = ConversationStore::new();
        let first = ConversationMessage::user("one");
        let second = ConversationMessage::assistant("two");
        let (first_id, second_id) = (first.id, second.id);
        store.append(first).unwrap();
        store.append(second).unwrap();

        let ids = store.messages().iter().map(|message| message.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![first_id, second_id]);
        assert_eq!(store.get(second_id).map(|message| message.role), Some(Role::Assistant));
    }

    #[test]
    fn starting_message_is_indexed() {
        let greeting = ConversationMessage::assistant("hello");
        let greeting_id = greeting.id;
        let mut store = ConversationStore::starting_with(greeting);

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(greeting_id).map(|message| message.role), Some(Role::Assistant));
        let duplicate = ConversationMessage::new(greeting_id, Role::User, "again");
        assert!(matches!(
            store.append(duplicate).unwrap_err(),
            StoreError::DuplicateMessage { .. }
        ));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut store = ConversationStore::new();
        let message = ConversationMessage::user("one");
        let duplicate = ConversationMessage::new(message.id, Role::User, "again");
        store.append(message).unwrap();

        let error = store.append(duplicate).unwrap_err();
        assert!(matches!(error, StoreError::DuplicateMessage { .. }));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn update_replaces_fields_in_place() {
        let mut store = ConversationStore::new();
        let user = ConversationMessage::user("topic");
        let task = TaskState::new(scenecast_storage::MessageId::new_v7(), "topic");
        let task_id = task.id;
        store.append(user).unwrap();
        store
            .append(ConversationMessage::task("Generating video...", task))
            .unwrap();

        let mut next = store.task(task_id).unwrap().snapshot();
        next.phase = Phase::Errored;
        next.error_message = Some("boom".to_string());
        store.update_message(task_id, MessagePatch::task(next)).unwrap();

        let message = &store.messages()[1];
        assert_eq!(message.content, "Generation failed: boom");
        assert_eq!(message.task.as_ref().map(|task| task.phase), Some(Phase::Errored));
    }

    #[test]
    fn updating_an_unknown_id_fails() {
        let mut store = ConversationStore::new();
        let stray = TaskState::new(scenecast_storage::MessageId::new_v7(), "topic");
        let error = store
            .update_message(stray.id, MessagePatch::task(stray))
            .unwrap_err();
        assert!(matches!(error, StoreError::UnknownMessage { .. }));
    }

    #[test]
    fn take_task_leaves_the_message_in_place() {
        let task = TaskState::new(scenecast_storage::MessageId::new_v7(), "topic");
        let task_id = task.id;
        let mut store =
            ConversationStore::from_messages(vec![ConversationMessage::task("…", task)]).unwrap();

        let taken = store.take_task(task_id).unwrap();
        assert!(taken.is_some());
        assert!(store.get(task_id).is_some());
        assert!(store.task(task_id).is_none());
    }
}
