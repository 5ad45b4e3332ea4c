//! Krishi voice session core.
//!
//! Library behind the farmer's voice assistant: it obtains a room credential,
//! joins the real-time media service, publishes the microphone, plays the agent's
//! audio and collects side-channel text into a transcript. The UI layer drives it
//! through [`session::SessionConnectionManager`] and renders the observable state.

pub mod config;
pub mod error;
pub mod identity;
pub mod media;
pub mod relay;
pub mod session;
pub mod telemetry;
pub mod token;
pub mod transcript;
pub mod transport;

pub use config::{Config, ConfigError};
pub use error::{MediaError, SessionError, TokenError};
pub use session::{Session, SessionConnectionManager, SessionServices, SessionState};
pub use transcript::{TranscriptEntry, TranscriptLog, TranscriptUpdate};
