use std::cmp::Ordering;
use std::fmt;

macro_rules! define_text_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

define_text_id!(SessionId);
define_text_id!(RequestId);

/// Client-minted id for an optimistic message. It sorts after the server id it was
/// minted behind and before the next one, in minting order.
///
/// A reply shares its parent's `after` and `seq` and takes a non-zero `reply`, so it
/// sits directly behind the message it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId {
    pub after: u64,
    pub seq: u64,
    pub reply: u64,
}

impl LocalId {
    /// Anchor for ids minted before any history is known; sorts after every server id.
    pub const UNPLACED: u64 = u64::MAX;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Server(u64),
    Local(LocalId),
}

impl MessageId {
    pub fn server(&self) -> Option<u64> {
        match self {
            Self::Server(id) => Some(*id),
            Self::Local(_) => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Server id this id sorts behind; a server id is its own anchor.
    pub fn anchor(&self) -> u64 {
        match self {
            Self::Server(id) => *id,
            Self::Local(local) => local.after,
        }
    }

    fn sort_key(&self) -> (u64, u8, u64, u64) {
        match self {
            Self::Server(id) => (*id, 0, 0, 0),
            Self::Local(local) => (local.after, 1, local.seq, local.reply),
        }
    }
}

impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => write!(formatter, "{id}"),
            Self::Local(local) => {
                if local.after == LocalId::UNPLACED {
                    write!(formatter, "local-end.{}", local.seq)?;
                } else {
                    write!(formatter, "local-{}.{}", local.after, local.seq)?;
                }
                if local.reply > 0 {
                    write!(formatter, ".{}", local.reply)?;
                }
                Ok(())
            }
        }
    }
}

impl From<u64> for MessageId {
    fn from(value: u64) -> Self {
        Self::Server(value)
    }
}
