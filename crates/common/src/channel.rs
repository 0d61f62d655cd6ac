// Channel naming conventions.
//
// A channel's variant is implied by its name prefix: `private-*` requires a
// signature to subscribe, `presence-*` requires a user identity and tracks a
// member roster, anything else is public.

pub const PRIVATE_PREFIX: &str = "private-";
pub const PRESENCE_PREFIX: &str = "presence-";

/// Maximum accepted channel-name length.
pub const MAX_CHANNEL_NAME_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    pub fn of(name: &str) -> Self {
        if name.starts_with(PRIVATE_PREFIX) {
            Self::Private
        } else if name.starts_with(PRESENCE_PREFIX) {
            Self::Presence
        } else {
            Self::Public
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Presence => "presence",
        }
    }

    pub const fn requires_authorization(self) -> bool {
        matches!(self, Self::Private | Self::Presence)
    }
}

/// Validate a channel name: non-empty, bounded length, drawn from the
/// conventional channel alphabet (alphanumerics plus `-_=@,.;`).
pub fn valid_channel_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_CHANNEL_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || "-_=@,.;".contains(c))
}
