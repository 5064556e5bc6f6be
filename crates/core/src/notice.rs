use std::fmt;

/// A user-facing alert raised by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Microphone access was refused; the session did not start.
    PermissionRequired,
    /// Reconnect attempts are exhausted.
    ConnectionFailed,
    /// The inactivity timeout stopped a recording.
    SilenceTimeout,
    /// The server rejected the last turn. Carries the server's text verbatim.
    ServerError(String),
    /// The microphone could not be started.
    RecordingStartFailed,
    /// The finished capture could not be read or encoded.
    RecordingProcessingFailed,
    /// The synthesizer failed to speak a reply.
    SpeechFailed,
}

impl Notice {
    pub fn title(&self) -> &str {
        match self {
            Notice::PermissionRequired => "권한 필요",
            Notice::ConnectionFailed => "연결 실패",
            Notice::SilenceTimeout => "대화 종료",
            Notice::ServerError(_) => "처리 오류",
            Notice::RecordingStartFailed | Notice::RecordingProcessingFailed => "녹음 오류",
            Notice::SpeechFailed => "음성 출력 오류",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Notice::PermissionRequired => "음성 인식을 위해 마이크 권한이 필요합니다.",
            Notice::ConnectionFailed => {
                "서버에 연결할 수 없습니다. 잠시 후 앱을 다시 시작해 주세요."
            }
            Notice::SilenceTimeout => "음성이 감지되지 않아 대화를 종료합니다.",
            Notice::ServerError(content) => content,
            Notice::RecordingStartFailed => "음성 녹음을 시작할 수 없습니다.",
            Notice::RecordingProcessingFailed => "음성 처리 중 오류가 발생했습니다.",
            Notice::SpeechFailed => "AI 응답을 읽어 줄 수 없습니다.",
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title(), self.message())
    }
}
