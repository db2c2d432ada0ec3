use crate::channel::ChannelScheme;
use crate::tag::ChannelId;
use std::sync::OnceLock;
use thiserror::Error;

/// Environment variable overriding the channel numbering scheme (`zero` or
/// `one`). Evaluated once, when the scheme is first frozen.
pub const CHANNEL_SCHEME_ENV: &str = "TAGSTREAM_CHANNEL_SCHEME";

static SCHEME: OnceLock<ChannelScheme> = OnceLock::new();

/// Errors raised during construction or configuration. A measurement that
/// fails construction is never attached to the engine.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("channel numbering scheme already frozen to {frozen:?}")]
    SchemeFrozen { frozen: ChannelScheme },
    #[error("invalid channel {channel} for {what}")]
    InvalidChannel { channel: ChannelId, what: &'static str },
    #[error("duplicate channel {channel} in {what}")]
    DuplicateChannel { channel: ChannelId, what: &'static str },
    #[error("{what} must be positive, got {value}")]
    NonPositive { what: &'static str, value: i64 },
    #[error("negative delay of {delay} ps is not supported; delay the remaining channels instead")]
    NegativeDelay { delay: i64 },
    #[error("{what} supports at most {limit} channels, got {count}")]
    TooManyChannels {
        what: &'static str,
        count: usize,
        limit: usize,
    },
    #[error("{what}: {detail}")]
    Invalid { what: &'static str, detail: String },
    #[error("engine has shut down")]
    EngineStopped,
}

/// Returns the process-wide numbering scheme, freezing it on first use.
///
/// Resolution order: an explicit `set_channel_scheme` call, then the
/// `TAGSTREAM_CHANNEL_SCHEME` environment variable, then `One`.
pub fn channel_scheme() -> ChannelScheme {
    *SCHEME.get_or_init(|| match std::env::var(CHANNEL_SCHEME_ENV) {
        Ok(value) if value.eq_ignore_ascii_case("zero") => ChannelScheme::Zero,
        _ => ChannelScheme::One,
    })
}

/// Selects the numbering scheme before the first engine is created. Once a
/// source has been opened the scheme is frozen and conflicting requests fail.
pub fn set_channel_scheme(scheme: ChannelScheme) -> Result<(), ConfigError> {
    let frozen = *SCHEME.get_or_init(|| scheme);
    if frozen != scheme {
        return Err(ConfigError::SchemeFrozen { frozen });
    }
    Ok(())
}
