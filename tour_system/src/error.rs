//! Component-boundary error taxonomy, composed the same way across the crate: one
//! [`error_set::error_set`] block per component, joined with `||` where a caller needs to match
//! on either side.

error_set::error_set! {
    TourSystemError = AudioError || TtsQueueError || AskError || TourError || IngestError || PersistenceError;

    AudioError = {
        #[display("WAV header exceeded the 64 KiB sanity limit")]
        HeaderTooLarge,
        #[display("unsupported WAV format: audioFormat={audio_format}, bitsPerSample={bits_per_sample}")]
        UnsupportedFormat { audio_format: u16, bits_per_sample: u16 },
        #[display("channel count changed mid-stream ({from} -> {to})")]
        ChannelCountChanged { from: u16, to: u16 },
        #[display("no output device available")]
        NoOutputDevice,
        #[display("audio decode failed: {message}")]
        Decode { message: String },
        #[display("audio content failed the sanity probe: {reason}")]
        AbnormalAudio { reason: String },
    } || {
        #[display("I/O error: {source}")]
        Io { source: std::io::Error },
    };

    TtsQueueError = AudioError;

    AskError = {
        #[display("network error contacting ask endpoint: {source}")]
        Network { source: reqwest::Error },
        #[display("malformed event frame: {line}")]
        MalformedFrame { line: String },
        #[display("ask turn was cancelled")]
        Cancelled,
    };

    TourError = {
        #[display("no such tour stop: {index}")]
        NoSuchStop { index: i64 },
        #[display("prefetch request failed: {source}")]
        PrefetchFailed { source: reqwest::Error },
        #[display("tour plan has not been loaded yet")]
        PlanNotLoaded,
    };

    IngestError = {
        #[display("microphone unavailable: {message}")]
        MicUnavailable { message: String },
        #[display("recording too short: {millis}ms < minimum")]
        RecordingTooShort { millis: u64 },
        #[display("ASR websocket protocol violation: {message}")]
        WsProtocol { message: String },
        #[display("network error contacting speech-to-text endpoint: {source}")]
        Network { source: reqwest::Error },
    };

    PersistenceError = {
        #[display("I/O error while reading/writing persisted state: {source}")]
        Io { source: std::io::Error },
        #[display("failed to (de)serialise persisted state: {source}")]
        Json { source: serde_json::Error },
    };
}
