//! Call-mode turn-taking.
//!
//! [`VoiceLoop`] is a small state machine that sits between the speech
//! capabilities (recognition and synthesis) and the chat client. The
//! capabilities call back into it; it answers with [`VoiceCommand`]s the
//! front end carries out.
//!
//! Every callback carries the [`Epoch`] that was current when the capability
//! was started. Leaving call mode bumps the epoch, so a late "recognition
//! ended" from a previous call can never restart the microphone.

use std::time::Duration;

/// Delay before listening again after a recognition error.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Recognition error reported when the user simply said nothing.
pub const NO_SPEECH: &str = "no-speech";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    Listening,
    Speaking,
}

/// Token identifying one call-mode session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(pub u64);

/// What the host platform can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpeechCapabilities {
    pub recognition: bool,
    pub synthesis: bool,
}

impl SpeechCapabilities {
    pub fn full() -> Self {
        Self { recognition: true, synthesis: true }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoiceError {
    #[error("call mode needs both speech recognition and speech synthesis")]
    Unsupported,
}

/// Side effects the front end must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceCommand {
    StartListening(Epoch),
    /// Start listening again after [`RETRY_DELAY`].
    RetryListening(Epoch, Duration),
    /// Send a recognised transcript as a chat message.
    Send(String),
    Speak(Epoch, String),
    StopAll,
}

#[derive(Debug, Clone)]
pub struct VoiceLoop {
    caps: SpeechCapabilities,
    state: VoiceState,
    epoch: Epoch,
    /// A transcript was sent during the current recognition pass.
    awaiting_reply: bool,
    /// A delayed retry was issued; the "end" that follows the error must not
    /// restart recognition a second time.
    retry_pending: bool,
}

impl VoiceLoop {
    pub fn new(caps: SpeechCapabilities) -> Self {
        Self {
            caps,
            state: VoiceState::Idle,
            epoch: Epoch::default(),
            awaiting_reply: false,
            retry_pending: false,
        }
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn in_call(&self) -> bool {
        self.state != VoiceState::Idle
    }

    pub fn is_supported(&self) -> bool {
        self.caps.recognition && self.caps.synthesis
    }

    /// The mic control is disabled while the AI is speaking.
    pub fn mic_enabled(&self) -> bool {
        self.state != VoiceState::Speaking
    }

    fn current(&self, epoch: Epoch) -> bool {
        self.in_call() && epoch == self.epoch
    }

    fn start_listening(&mut self) -> Vec<VoiceCommand> {
        self.state = VoiceState::Listening;
        self.retry_pending = false;
        vec![VoiceCommand::StartListening(self.epoch)]
    }

    // -- user actions ----------------------------------------------------------

    pub fn enter_call(&mut self) -> Result<Vec<VoiceCommand>, VoiceError> {
        if !self.is_supported() {
            return Err(VoiceError::Unsupported);
        }
        if self.in_call() {
            return Ok(Vec::new());
        }
        self.epoch = Epoch(self.epoch.0 + 1);
        self.awaiting_reply = false;
        Ok(self.start_listening())
    }

    pub fn exit_call(&mut self) -> Vec<VoiceCommand> {
        if !self.in_call() {
            return Vec::new();
        }
        self.epoch = Epoch(self.epoch.0 + 1);
        self.state = VoiceState::Idle;
        self.awaiting_reply = false;
        self.retry_pending = false;
        vec![VoiceCommand::StopAll]
    }

    pub fn toggle_call(&mut self) -> Result<Vec<VoiceCommand>, VoiceError> {
        if self.in_call() {
            Ok(self.exit_call())
        } else {
            self.enter_call()
        }
    }

    // -- recognition callbacks -------------------------------------------------

    pub fn on_transcript(&mut self, epoch: Epoch, transcript: &str) -> Vec<VoiceCommand> {
        if !self.current(epoch) || self.state != VoiceState::Listening {
            return Vec::new();
        }
        let text = transcript.trim();
        if text.is_empty() {
            return Vec::new();
        }
        self.awaiting_reply = true;
        vec![VoiceCommand::Send(text.to_string())]
    }

    pub fn on_recognition_end(&mut self, epoch: Epoch) -> Vec<VoiceCommand> {
        if !self.current(epoch) || self.state != VoiceState::Listening || self.awaiting_reply {
            return Vec::new();
        }
        if self.retry_pending {
            self.retry_pending = false;
            return Vec::new();
        }
        self.start_listening()
    }

    pub fn on_recognition_error(&mut self, epoch: Epoch, error: &str) -> Vec<VoiceCommand> {
        if !self.current(epoch) || self.state != VoiceState::Listening || error == NO_SPEECH {
            return Vec::new();
        }
        if self.retry_pending {
            return Vec::new();
        }
        self.retry_pending = true;
        vec![VoiceCommand::RetryListening(self.epoch, RETRY_DELAY)]
    }

    // -- chat / synthesis callbacks -------------------------------------------

    /// A chat message arrived. Only AI messages during a call are spoken.
    pub fn on_message(&mut self, author: &str, ai_label: &str, text: &str) -> Vec<VoiceCommand> {
        if !self.in_call() || author != ai_label || text.trim().is_empty() {
            return Vec::new();
        }
        self.state = VoiceState::Speaking;
        self.awaiting_reply = false;
        vec![VoiceCommand::Speak(self.epoch, text.to_string())]
    }

    pub fn on_speech_end(&mut self, epoch: Epoch) -> Vec<VoiceCommand> {
        if !self.current(epoch) || self.state != VoiceState::Speaking {
            return Vec::new();
        }
        self.start_listening()
    }

    pub fn on_speech_error(&mut self, epoch: Epoch) -> Vec<VoiceCommand> {
        self.on_speech_end(epoch)
    }
}
