use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(RoomId);
id_newtype!(EventId);
id_newtype!(UserId);
id_newtype!(DeviceId);
id_newtype!(SessionId);
id_newtype!(TransactionId);

impl TransactionId {
    /// A fresh id for one homeserver request. The server deduplicates
    /// retried requests that carry the same id.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}
