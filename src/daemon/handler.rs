//! Command handler: the service state machine.
//!
//! `ServiceState` has a single owner — this handler's mutex — and every
//! transition happens on the serialized command path or in the pipeline
//! watcher, so state changes need no further locking.

use crate::audio::segmenter::SegmenterConfig;
use crate::audio::source::FrameSource;
use crate::config::{SessionConfig, SessionUpdate};
use crate::error::Result;
use crate::ipc::protocol::{Command, ErrorCode, Response, ServiceState, StreamMessage};
use crate::ipc::server::{CommandHandler, ConnectionSession};
use crate::pipeline::{ChunkOutcome, Pipeline, PipelineConfig, PipelineEvent, PipelineHandle};
use crate::stt::recognizer::Recognizer;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, watch};

/// Builds a fresh capture source for each recording. The backend itself is
/// chosen once at daemon startup.
pub type SourceFactory = Box<dyn Fn() -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// Builds a recognizer when `configure` switches models.
pub type RecognizerFactory =
    Box<dyn Fn(&SessionConfig) -> Result<Arc<dyn Recognizer>> + Send + Sync>;

/// A live pipeline plus the tasks shuttling its output to clients.
struct RunningPipeline {
    handle: PipelineHandle,
    /// Forwards TranscriptionResults to the broadcast channel; ends when the
    /// pipeline's result channel closes.
    forwarder: tokio::task::JoinHandle<()>,
    /// Watches pipeline events (falling-behind, capture loss); ends with the
    /// event channel.
    watcher: tokio::task::JoinHandle<()>,
}

/// Daemon state: active config, service state, loaded model, live pipeline.
pub struct DaemonState {
    pub config: SessionConfig,
    pub state: ServiceState,
    pub recognizer: Arc<dyn Recognizer>,
    pipeline: Option<RunningPipeline>,
}

impl DaemonState {
    /// True while a pipeline is active.
    pub fn is_recording(&self) -> bool {
        self.state == ServiceState::Recording
    }
}

/// Command handler for the daemon's control socket.
pub struct DaemonCommandHandler {
    state: Arc<Mutex<DaemonState>>,
    events: broadcast::Sender<StreamMessage>,
    shutdown: watch::Sender<bool>,
    source_factory: SourceFactory,
    recognizer_factory: RecognizerFactory,
    quiet: bool,
}

impl DaemonCommandHandler {
    /// Create the handler with its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SessionConfig,
        recognizer: Arc<dyn Recognizer>,
        source_factory: SourceFactory,
        recognizer_factory: RecognizerFactory,
        events: broadcast::Sender<StreamMessage>,
        shutdown: watch::Sender<bool>,
        quiet: bool,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(DaemonState {
                config,
                state: ServiceState::Idle,
                recognizer,
                pipeline: None,
            })),
            events,
            shutdown,
            source_factory,
            recognizer_factory,
            quiet,
        }
    }

    /// Shared state handle, used by tests to inspect transitions.
    pub fn state(&self) -> Arc<Mutex<DaemonState>> {
        Arc::clone(&self.state)
    }

    async fn configure(&self, update: SessionUpdate) -> Response {
        let mut state = self.state.lock().await;
        match state.state {
            ServiceState::Idle => {}
            ServiceState::Recording | ServiceState::Draining => {
                return Response::state_conflict(
                    "Cannot configure while recording; stop recording first",
                );
            }
            ServiceState::ShuttingDown => return Response::state_conflict("Shutting down"),
            ServiceState::Configuring => {
                return Response::state_conflict("Configuration already in progress");
            }
        }

        state.state = ServiceState::Configuring;

        // Validate against a copy so a rejected update leaves nothing applied
        let mut candidate = state.config.clone();
        let model_changed = match candidate.apply(&update) {
            Ok(changed) => changed,
            Err(e) => {
                state.state = ServiceState::Idle;
                return Response::error_with_code(ErrorCode::Protocol, e.to_string());
            }
        };

        if model_changed {
            match (self.recognizer_factory)(&candidate) {
                Ok(recognizer) => {
                    if !self.quiet {
                        eprintln!("scribed: switched model to '{}'", candidate.model);
                    }
                    state.recognizer = recognizer;
                }
                Err(e) => {
                    state.state = ServiceState::Idle;
                    return Response::error_with_code(
                        ErrorCode::Recognition,
                        format!("Failed to load model '{}': {}", candidate.model, e),
                    );
                }
            }
        }

        state.config = candidate;
        state.state = ServiceState::Idle;
        Response::success("Configuration updated")
    }

    async fn start_recording(&self) -> Response {
        let mut state = self.state.lock().await;
        match state.state {
            ServiceState::Idle => {}
            ServiceState::Recording | ServiceState::Draining => {
                return Response::state_conflict("Already recording");
            }
            ServiceState::ShuttingDown => return Response::state_conflict("Shutting down"),
            ServiceState::Configuring => {
                return Response::state_conflict("Configuration in progress");
            }
        }

        let source = match (self.source_factory)() {
            Ok(source) => source,
            Err(e) => {
                return Response::error_with_code(
                    ErrorCode::Capture,
                    format!("Failed to open audio source: {}", e),
                );
            }
        };

        let pipeline_config = PipelineConfig {
            segmenter: SegmenterConfig::from_session(&state.config),
            quiet: self.quiet,
            ..Default::default()
        };

        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();

        let handle = match Pipeline::new(pipeline_config).start(
            source,
            Arc::clone(&state.recognizer),
            result_tx,
            event_tx,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                return Response::error_with_code(
                    ErrorCode::Capture,
                    format!("Failed to start pipeline: {}", e),
                );
            }
        };

        // Forward results to all subscribed connections, in chunk order
        let events = self.events.clone();
        let forwarder = tokio::task::spawn_blocking(move || {
            for result in result_rx.iter() {
                let msg = match result.outcome {
                    ChunkOutcome::Text { text, .. } => StreamMessage::Transcription {
                        sequence: result.sequence,
                        text,
                        start: result.start,
                        end: result.end,
                        transcription_time: result.transcription_time,
                    },
                    ChunkOutcome::Failed { message } => StreamMessage::Error {
                        sequence: Some(result.sequence),
                        message,
                    },
                };
                // No subscribers is fine; results are not persisted
                let _ = events.send(msg);
            }
        });

        // Watch for capture loss: fatal to the pipeline, not the service
        let watch_state = Arc::clone(&self.state);
        let watch_events = self.events.clone();
        let quiet = self.quiet;
        let watcher = tokio::task::spawn_blocking(move || {
            for event in event_rx.iter() {
                match event {
                    PipelineEvent::FallingBehind { queued } => {
                        if !quiet {
                            eprintln!(
                                "scribed: recognition falling behind ({queued} chunks queued); \
                                 capture continues, no audio dropped"
                            );
                        }
                    }
                    PipelineEvent::CaptureFailed { message } => {
                        let mut state = watch_state.blocking_lock();
                        if state.state == ServiceState::Recording {
                            if let Some(running) = state.pipeline.take() {
                                running.handle.stop();
                            }
                            state.state = ServiceState::Idle;
                            let _ = watch_events.send(StreamMessage::State {
                                state: ServiceState::Idle,
                                message: Some(format!("recording stopped: {}", message)),
                            });
                        }
                    }
                }
            }
        });

        state.pipeline = Some(RunningPipeline {
            handle,
            forwarder,
            watcher,
        });
        state.state = ServiceState::Recording;
        Response::success("Recording started")
    }

    async fn stop_recording(&self) -> Response {
        let mut state = self.state.lock().await;
        match state.state {
            ServiceState::Recording => {}
            // Idempotent: stopping an idle service is a no-op success
            ServiceState::Idle => return Response::success("Not recording"),
            ServiceState::Draining => return Response::success("Stop already in progress"),
            ServiceState::ShuttingDown => return Response::state_conflict("Shutting down"),
            ServiceState::Configuring => {
                return Response::state_conflict("Configuration in progress");
            }
        }

        let running = state.pipeline.take();
        state.state = ServiceState::Draining;
        // Release the lock so get_status can observe Draining while the
        // in-flight chunk finishes.
        drop(state);

        if let Some(running) = running {
            let handle = running.handle;
            let _ = tokio::task::spawn_blocking(move || handle.stop()).await;
            // The ack must come after the last result reached the broadcast
            // channel; both tasks end when the pipeline's channels close.
            let _ = running.forwarder.await;
            let _ = running.watcher.await;
        }

        let mut state = self.state.lock().await;
        // A concurrent shutdown may have superseded the drain
        if state.state == ServiceState::Draining {
            state.state = ServiceState::Idle;
        }
        let _ = self.events.send(StreamMessage::State {
            state: ServiceState::Idle,
            message: Some("recording stopped".to_string()),
        });
        Response::success("Recording stopped")
    }

    async fn get_status(&self) -> Response {
        let state = self.state.lock().await;
        Response::status_snapshot(state.state, state.config.model.clone(), state.config.clone())
    }

    async fn shutdown(&self) -> Response {
        let mut state = self.state.lock().await;
        if state.state == ServiceState::ShuttingDown {
            return Response::success("Already shutting down");
        }

        let running = state.pipeline.take();
        state.state = ServiceState::ShuttingDown;
        drop(state);

        // Wait out an in-flight chunk rather than discarding it; stop() is
        // bounded by the shutdown grace period.
        if let Some(running) = running {
            let handle = running.handle;
            let _ = tokio::task::spawn_blocking(move || handle.stop()).await;
            let _ = running.forwarder.await;
            let _ = running.watcher.await;
        }

        // The server's accept loop and every connection observe this token:
        // notices go out, connections close, the socket file is removed.
        let _ = self.shutdown.send(true);
        Response::success("Shutting down")
    }
}

#[async_trait::async_trait]
impl CommandHandler for DaemonCommandHandler {
    async fn handle(&self, command: Command, session: &mut ConnectionSession) -> Response {
        match command {
            Command::Configure(update) => self.configure(update).await,
            Command::StartRecording => {
                let response = self.start_recording().await;
                if response.is_success() {
                    // The connection that starts a recording wants its results
                    session.streaming = true;
                }
                response
            }
            Command::StopRecording => self.stop_recording().await,
            Command::GetStatus => self.get_status().await,
            Command::Subscribe => {
                session.streaming = true;
                Response::success("subscribed")
            }
            Command::Shutdown => self.shutdown().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::source::{FramePhase, MockFrameSource};
    use crate::defaults::FRAME_SAMPLES;
    use crate::error::ScribedError;
    use crate::stt::recognizer::MockRecognizer;

    fn mock_source_factory(template: MockFrameSource) -> SourceFactory {
        Box::new(move || Ok(Box::new(template.clone()) as Box<dyn FrameSource>))
    }

    fn failing_source_factory() -> SourceFactory {
        Box::new(|| {
            Err(ScribedError::AudioDeviceNotFound {
                device: "default".to_string(),
            })
        })
    }

    fn mock_recognizer_factory() -> RecognizerFactory {
        Box::new(|config| {
            if config.model == "broken" {
                Err(ScribedError::ModelNotFound {
                    path: "broken".to_string(),
                })
            } else {
                Ok(Arc::new(MockRecognizer::new(&config.model)) as Arc<dyn Recognizer>)
            }
        })
    }

    fn live_speech_source() -> MockFrameSource {
        MockFrameSource::new()
            .as_live_source()
            .with_frame_sequence(vec![
                FramePhase {
                    samples: vec![3000i16; FRAME_SAMPLES],
                    count: 10,
                },
                FramePhase {
                    samples: vec![0i16; FRAME_SAMPLES],
                    count: 10,
                },
            ])
    }

    fn make_handler(source_factory: SourceFactory) -> (DaemonCommandHandler, broadcast::Receiver<StreamMessage>) {
        let (events, events_rx) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);
        let handler = DaemonCommandHandler::new(
            SessionConfig::default(),
            Arc::new(MockRecognizer::new("base").with_response("hello")),
            source_factory,
            mock_recognizer_factory(),
            events,
            shutdown,
            true,
        );
        (handler, events_rx)
    }

    async fn handle(handler: &DaemonCommandHandler, command: Command) -> Response {
        let mut session = ConnectionSession::default();
        handler.handle(command, &mut session).await
    }

    #[tokio::test]
    async fn status_starts_idle_with_defaults() {
        let (handler, _events) = make_handler(mock_source_factory(live_speech_source()));

        let response = handle(&handler, Command::GetStatus).await;
        assert!(response.is_success());
        assert_eq!(response.state, Some(ServiceState::Idle));
        assert_eq!(response.recording, Some(false));
        assert_eq!(response.model, Some("base".to_string()));
        assert!(response.config.is_some());
    }

    #[tokio::test]
    async fn start_then_stop_transitions_back_to_idle() {
        let (handler, _events) = make_handler(mock_source_factory(live_speech_source()));

        let response = handle(&handler, Command::StartRecording).await;
        assert!(response.is_success(), "start failed: {}", response.message);
        assert!(handler.state().lock().await.is_recording());

        let response = handle(&handler, Command::StopRecording).await;
        assert!(response.is_success());
        assert_eq!(handler.state().lock().await.state, ServiceState::Idle);
    }

    #[tokio::test]
    async fn start_while_recording_is_state_conflict_and_state_unchanged() {
        let (handler, _events) = make_handler(mock_source_factory(live_speech_source()));

        assert!(handle(&handler, Command::StartRecording).await.is_success());

        let response = handle(&handler, Command::StartRecording).await;
        assert!(!response.is_success());
        assert_eq!(response.code, Some(ErrorCode::StateConflict));
        assert_eq!(response.message, "Already recording");
        // The conflict must not disturb the active recording
        assert_eq!(handler.state().lock().await.state, ServiceState::Recording);

        handle(&handler, Command::StopRecording).await;
    }

    #[tokio::test]
    async fn stop_twice_is_idempotent_success() {
        let (handler, _events) = make_handler(mock_source_factory(live_speech_source()));

        assert!(handle(&handler, Command::StartRecording).await.is_success());
        assert!(handle(&handler, Command::StopRecording).await.is_success());

        let response = handle(&handler, Command::StopRecording).await;
        assert!(response.is_success(), "second stop must be a no-op success");
        assert_eq!(response.message, "Not recording");
    }

    #[tokio::test]
    async fn stop_delivers_pending_results_before_ack() {
        let (handler, mut events) = make_handler(mock_source_factory(live_speech_source()));

        assert!(handle(&handler, Command::StartRecording).await.is_success());
        // Give the 10 voiced frames time to be captured (16ms poll per read)
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;

        assert!(handle(&handler, Command::StopRecording).await.is_success());

        // By ack time the forced-flush chunk's result is already broadcast
        let mut saw_transcription = false;
        while let Ok(msg) = events.try_recv() {
            if let StreamMessage::Transcription { text, .. } = msg {
                assert_eq!(text, "hello");
                saw_transcription = true;
            }
        }
        assert!(saw_transcription, "stop ack must follow the final result");
    }

    #[tokio::test]
    async fn configure_while_idle_applies_atomically() {
        let (handler, _events) = make_handler(mock_source_factory(live_speech_source()));

        let update = SessionUpdate {
            silence_threshold: Some(0.05),
            vad_silence_duration: Some(1.0),
            ..Default::default()
        };
        let response = handle(&handler, Command::Configure(update)).await;
        assert!(response.is_success());

        let state = handler.state();
        let state = state.lock().await;
        assert_eq!(state.config.silence_threshold, 0.05);
        assert_eq!(state.config.vad_silence_duration, 1.0);
        assert_eq!(state.state, ServiceState::Idle);
    }

    #[tokio::test]
    async fn configure_swaps_recognizer_on_model_change() {
        let (handler, _events) = make_handler(mock_source_factory(live_speech_source()));

        let update = SessionUpdate {
            model: Some("tiny".to_string()),
            ..Default::default()
        };
        assert!(handle(&handler, Command::Configure(update)).await.is_success());

        let state = handler.state();
        let state = state.lock().await;
        assert_eq!(state.config.model, "tiny");
        assert_eq!(state.recognizer.model_name(), "tiny");
    }

    #[tokio::test]
    async fn configure_model_load_failure_leaves_config_untouched() {
        let (handler, _events) = make_handler(mock_source_factory(live_speech_source()));

        let update = SessionUpdate {
            model: Some("broken".to_string()),
            silence_threshold: Some(0.9),
            ..Default::default()
        };
        let response = handle(&handler, Command::Configure(update)).await;
        assert!(!response.is_success());
        assert_eq!(response.code, Some(ErrorCode::Recognition));

        let state = handler.state();
        let state = state.lock().await;
        assert_eq!(state.config.model, "base");
        assert_eq!(state.config.silence_threshold, 0.01);
        assert_eq!(state.state, ServiceState::Idle);
    }

    #[tokio::test]
    async fn configure_while_recording_is_rejected() {
        let (handler, _events) = make_handler(mock_source_factory(live_speech_source()));

        assert!(handle(&handler, Command::StartRecording).await.is_success());

        let update = SessionUpdate {
            model: Some("tiny".to_string()),
            ..Default::default()
        };
        let response = handle(&handler, Command::Configure(update)).await;
        assert!(!response.is_success());
        assert_eq!(response.code, Some(ErrorCode::StateConflict));

        handle(&handler, Command::StopRecording).await;
    }

    #[tokio::test]
    async fn invalid_configure_value_is_rejected_without_side_effects() {
        let (handler, _events) = make_handler(mock_source_factory(live_speech_source()));

        let update = SessionUpdate {
            silence_threshold: Some(2.0),
            ..Default::default()
        };
        let response = handle(&handler, Command::Configure(update)).await;
        assert!(!response.is_success());

        let state = handler.state();
        assert_eq!(state.lock().await.config.silence_threshold, 0.01);
    }

    #[tokio::test]
    async fn start_with_failing_source_reports_capture_error() {
        let (handler, _events) = make_handler(failing_source_factory());

        let response = handle(&handler, Command::StartRecording).await;
        assert!(!response.is_success());
        assert_eq!(response.code, Some(ErrorCode::Capture));
        assert_eq!(handler.state().lock().await.state, ServiceState::Idle);
    }

    #[tokio::test]
    async fn capture_loss_forces_recording_to_idle_with_notice() {
        let template = MockFrameSource::new()
            .as_live_source()
            .with_read_failure()
            .with_error_message("device unplugged");
        let (handler, mut events) = make_handler(mock_source_factory(template));

        assert!(handle(&handler, Command::StartRecording).await.is_success());

        // 10 consecutive read failures at 16ms each, then the watcher runs
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if handler.state().lock().await.state == ServiceState::Idle {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "capture loss should force Recording → Idle"
            );
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let mut saw_notice = false;
        while let Ok(msg) = events.try_recv() {
            if let StreamMessage::State { state, message } = msg {
                assert_eq!(state, ServiceState::Idle);
                assert!(message.unwrap_or_default().contains("device unplugged"));
                saw_notice = true;
            }
        }
        assert!(saw_notice, "capture loss must be broadcast to sessions");
    }

    #[tokio::test]
    async fn subscribe_flips_session_streaming() {
        let (handler, _events) = make_handler(mock_source_factory(live_speech_source()));

        let mut session = ConnectionSession::default();
        assert!(!session.streaming);
        let response = handler.handle(Command::Subscribe, &mut session).await;
        assert!(response.is_success());
        assert!(session.streaming);
    }

    #[tokio::test]
    async fn start_recording_implicitly_subscribes_the_connection() {
        let (handler, _events) = make_handler(mock_source_factory(live_speech_source()));

        let mut session = ConnectionSession::default();
        let response = handler.handle(Command::StartRecording, &mut session).await;
        assert!(response.is_success());
        assert!(session.streaming);

        handle(&handler, Command::StopRecording).await;
    }

    #[tokio::test]
    async fn shutdown_stops_pipeline_and_triggers_token() {
        let (events, _events_rx) = broadcast::channel(64);
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handler = DaemonCommandHandler::new(
            SessionConfig::default(),
            Arc::new(MockRecognizer::new("base")),
            mock_source_factory(live_speech_source()),
            mock_recognizer_factory(),
            events,
            shutdown,
            true,
        );

        assert!(handle(&handler, Command::StartRecording).await.is_success());
        let response = handle(&handler, Command::Shutdown).await;
        assert!(response.is_success());

        assert_eq!(handler.state().lock().await.state, ServiceState::ShuttingDown);
        assert!(shutdown_rx.has_changed().unwrap());

        // Shutdown is terminal: everything else is now rejected
        let response = handle(&handler, Command::StartRecording).await;
        assert_eq!(response.code, Some(ErrorCode::StateConflict));
        let response = handle(&handler, Command::Shutdown).await;
        assert!(response.is_success(), "repeated shutdown is harmless");
    }
}
