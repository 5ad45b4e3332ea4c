//! Side-channel text from remote participants.

use crate::{
    error::DecodeError,
    transcript::{Sender, TranscriptEntry, TranscriptLog},
    transport::RemoteParticipant,
};
use tracing::{debug, warn};

/// Turns data-channel payloads into transcript entries.
pub struct DataChannelRelay {
    transcript: TranscriptLog,
}

impl DataChannelRelay {
    pub fn new(transcript: TranscriptLog) -> Self {
        Self { transcript }
    }

    /// Appends the payload as text from `participant`.
    ///
    /// Payloads that are not UTF-8 are dropped and logged; nothing is raised.
    pub fn on_data_received(
        &self,
        payload: &[u8],
        participant: &RemoteParticipant,
    ) -> Option<TranscriptEntry> {
        match decode(payload) {
            Ok(text) => {
                debug!(participant = %participant.identity, bytes = payload.len(), "Data message received");
                Some(
                    self.transcript
                        .append(Sender::Participant(participant.identity.clone()), text),
                )
            }
            Err(e) => {
                warn!(participant = %participant.identity, error = %e, "Dropping malformed data message");
                None
            }
        }
    }
}

fn decode(payload: &[u8]) -> Result<&str, DecodeError> {
    Ok(std::str::from_utf8(payload)?)
}
