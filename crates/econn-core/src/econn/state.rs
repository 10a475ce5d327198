use std::fmt;

/// State of an [`Econn`](super::Econn)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EconnState {
    Idle,
    PendingOutgoing,
    PendingIncoming,
    /// Glare lost: answering the remote SETUP instead of our own
    ConflictResolution,
    Answered,
    DatachanEstablished,
    UpdateSent,
    UpdateRecv,
    HangupSent,
    HangupRecv,
    /// Terminal
    Terminating,
}

impl EconnState {
    pub fn name(&self) -> &'static str {
        match self {
            EconnState::Idle => "Idle",
            EconnState::PendingOutgoing => "Pending-Outgoing",
            EconnState::PendingIncoming => "Pending-Incoming",
            EconnState::ConflictResolution => "Conflict-Resolution",
            EconnState::Answered => "Answered",
            EconnState::DatachanEstablished => "Datachan-Established",
            EconnState::UpdateSent => "Update-Sent",
            EconnState::UpdateRecv => "Update-Recv",
            EconnState::HangupSent => "Hangup-Sent",
            EconnState::HangupRecv => "Hangup-Recv",
            EconnState::Terminating => "Terminating",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EconnState::Terminating)
    }

    /// SETUP exchange completed in either direction
    pub fn is_answered(&self) -> bool {
        matches!(
            self,
            EconnState::Answered
                | EconnState::DatachanEstablished
                | EconnState::UpdateSent
                | EconnState::UpdateRecv
        )
    }

    /// Hangup handshake in progress or done
    pub fn is_ending(&self) -> bool {
        matches!(
            self,
            EconnState::HangupSent | EconnState::HangupRecv | EconnState::Terminating
        )
    }
}

impl fmt::Display for EconnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side initiated the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Unknown,
    Outgoing,
    Incoming,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Unknown => "Unknown",
            Direction::Outgoing => "Outgoing",
            Direction::Incoming => "Incoming",
        })
    }
}

/// Outcome of glare resolution, if there was any
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Conflict {
    #[default]
    None,
    /// Our SETUP governs the session; the remote offer was dropped
    Won,
    /// The remote SETUP governs the session; we answer it
    Lost,
}

impl Conflict {
    pub fn name(&self) -> &'static str {
        match self {
            Conflict::None => "none",
            Conflict::Won => "won",
            Conflict::Lost => "lost",
        }
    }
}
