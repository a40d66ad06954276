//! # Command Table
//!
//! Byte values for every post-handshake packet command the engine speaks
//! or routes. Values are the server-compatible assignments; unknown bytes
//! are still delivered to subscribers as raw commands.

/// Post-handshake packet commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Secret block pushed by the server after login.
    SecretBlock = 0x02,
    /// Server liveness probe; answered with [`Command::Pong`].
    Ping = 0x04,
    /// Request a byte range of an encrypted media file.
    GetSubStream = 0x08,
    /// Inbound channel fragment.
    ChannelData = 0x09,
    /// Inbound channel failure.
    ChannelError = 0x0a,
    /// Abort an open channel.
    ChannelAbort = 0x0b,
    /// Request the AES key for a media file.
    RequestKey = 0x0c,
    /// AES key delivery.
    AesKey = 0x0d,
    /// AES key failure.
    AesKeyError = 0x0e,
    /// Announce the client cache digest.
    CacheHash = 0x0f,
    ShaHash = 0x10,
    /// Request cover art by image id.
    Image = 0x19,
    CountryCode = 0x1b,
    /// Browse artist/album/track metadata.
    Browse = 0x30,
    /// Full-text search.
    Search = 0x31,
    /// Fetch a playlist.
    GetPlaylist = 0x35,
    /// Publish a playlist change.
    ChangePlaylist = 0x36,
    Notify = 0x42,
    Log = 0x48,
    /// Reply to [`Command::Ping`].
    Pong = 0x49,
    PongAck = 0x4a,
    Pause = 0x4b,
    /// Announce the intent to play.
    TokenNotify = 0x4c,
    /// Request an advertisement.
    RequestAd = 0x4e,
    /// Ask the server to pause other players on the account.
    RequestPlay = 0x4f,
    ProductInfo = 0x50,
    Welcome = 0x69,
}

impl Command {
    /// True when the first two payload bytes of an inbound packet with
    /// this command carry a channel id the dispatcher routes on.
    pub fn is_channel_bearing(self) -> bool {
        matches!(
            self,
            Command::ChannelData
                | Command::ChannelError
                | Command::AesKey
                | Command::AesKeyError
                | Command::GetSubStream
                | Command::Image
                | Command::Browse
                | Command::Search
                | Command::GetPlaylist
                | Command::ChangePlaylist
                | Command::RequestAd
        )
    }

    /// True when an inbound packet with this command retires the channel
    /// with an error instead of data.
    pub fn is_channel_error(self) -> bool {
        matches!(self, Command::ChannelError | Command::AesKeyError)
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            0x02 => Command::SecretBlock,
            0x04 => Command::Ping,
            0x08 => Command::GetSubStream,
            0x09 => Command::ChannelData,
            0x0a => Command::ChannelError,
            0x0b => Command::ChannelAbort,
            0x0c => Command::RequestKey,
            0x0d => Command::AesKey,
            0x0e => Command::AesKeyError,
            0x0f => Command::CacheHash,
            0x10 => Command::ShaHash,
            0x19 => Command::Image,
            0x1b => Command::CountryCode,
            0x30 => Command::Browse,
            0x31 => Command::Search,
            0x35 => Command::GetPlaylist,
            0x36 => Command::ChangePlaylist,
            0x42 => Command::Notify,
            0x48 => Command::Log,
            0x49 => Command::Pong,
            0x4a => Command::PongAck,
            0x4b => Command::Pause,
            0x4c => Command::TokenNotify,
            0x4e => Command::RequestAd,
            0x4f => Command::RequestPlay,
            0x50 => Command::ProductInfo,
            0x69 => Command::Welcome,
            other => return Err(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_known_commands() {
        for cmd in [
            Command::Ping,
            Command::ChannelData,
            Command::Search,
            Command::GetPlaylist,
            Command::Pong,
            Command::Welcome,
        ] {
            assert_eq!(Command::try_from(cmd as u8), Ok(cmd));
        }
    }

    #[test]
    fn test_unknown_command_is_preserved() {
        assert_eq!(Command::try_from(0x77), Err(0x77));
    }

    #[test]
    fn test_channel_bearing_classification() {
        assert!(Command::ChannelData.is_channel_bearing());
        assert!(Command::Search.is_channel_bearing());
        assert!(Command::AesKey.is_channel_bearing());
        assert!(!Command::Ping.is_channel_bearing());
        assert!(!Command::CacheHash.is_channel_bearing());
        assert!(Command::ChannelError.is_channel_error());
        assert!(!Command::ChannelData.is_channel_error());
    }
}
