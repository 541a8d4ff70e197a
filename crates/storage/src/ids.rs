use std::fmt;
use std::str::FromStr;

use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

// Ids are UUIDv7 so that rows sort by creation time; the text form is what
// both backends store.
macro_rules! define_storage_id {
    ($(#[$meta:meta])* $name:ident, $id_type:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Uuid);

        impl $name {
            /// Label used in error reports about this id.
            pub const ID_TYPE: &'static str = $id_type;

            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                Uuid::parse_str(raw.trim())
                    .map(Self)
                    .context(InvalidIdSnafu {
                        stage: "parse-storage-id",
                        id_type: Self::ID_TYPE,
                        raw: raw.to_string(),
                    })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, formatter)
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_storage_id!(
    /// One conversation session.
    SessionId,
    "session-id"
);
define_storage_id!(
    /// One conversation message. Task messages reuse it as the task id.
    MessageId,
    "message-id"
);
