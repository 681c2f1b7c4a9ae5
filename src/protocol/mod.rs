use std::fmt;
use std::str::FromStr;

/// Text commands sent client → server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Handshake only, no state change
    StartLink,
    /// Controller is leaving; force-stop everything it owns
    StopLink,
    StartStream,
    StopStream,
    StartRecord,
    StopRecord,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::StartLink => "START_LINK",
            Command::StopLink => "STOP_LINK",
            Command::StartStream => "START_STREAM",
            Command::StopStream => "STOP_STREAM",
            Command::StartRecord => "START_RECORD",
            Command::StopRecord => "STOP_RECORD",
        }
    }
}

impl FromStr for Command {
    type Err = UnknownWord;

    /// Case-insensitive, surrounding whitespace ignored
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let word = s.trim().to_ascii_uppercase();
        match word.as_str() {
            "START_LINK" => Ok(Command::StartLink),
            "STOP_LINK" => Ok(Command::StopLink),
            "START_STREAM" => Ok(Command::StartStream),
            "STOP_STREAM" => Ok(Command::StopStream),
            "START_RECORD" => Ok(Command::StartRecord),
            "STOP_RECORD" => Ok(Command::StopRecord),
            _ => Err(UnknownWord(word)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text notifications broadcast server → every client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    StreamStarted,
    StreamStopped,
    RecordStarted,
    RecordStopped,
}

impl Notification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Notification::StreamStarted => "STREAM_STARTED",
            Notification::StreamStopped => "STREAM_STOPPED",
            Notification::RecordStarted => "RECORD_STARTED",
            Notification::RecordStopped => "RECORD_STOPPED",
        }
    }
}

impl FromStr for Notification {
    type Err = UnknownWord;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let word = s.trim().to_ascii_uppercase();
        match word.as_str() {
            "STREAM_STARTED" => Ok(Notification::StreamStarted),
            "STREAM_STOPPED" => Ok(Notification::StreamStopped),
            "RECORD_STARTED" => Ok(Notification::RecordStarted),
            "RECORD_STOPPED" => Ok(Notification::RecordStopped),
            _ => Err(UnknownWord(word)),
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown word: {0:?}")]
pub struct UnknownWord(pub String);
