use std::{collections::VecDeque, sync::Arc, time::Instant};

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::gemini::ImageBackend;
use crate::models::{HistoryItem, ImageRef, Mode, SessionSnapshot};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("history item {0} not found")]
    HistoryItemNotFound(u64),
}

/// What the next prompt applies to. Editing always carries its image.
#[derive(Debug, Clone, PartialEq)]
pub enum Canvas {
    Blank,
    Editing(ImageRef),
}

impl Canvas {
    pub fn mode(&self) -> Mode {
        match self {
            Canvas::Blank => Mode::Generate,
            Canvas::Editing(_) => Mode::Edit,
        }
    }

    pub fn image(&self) -> Option<&ImageRef> {
        match self {
            Canvas::Blank => None,
            Canvas::Editing(image) => Some(image),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Activity {
    Idle,
    /// A request dispatched in `mode` is awaiting the backend.
    Busy { mode: Mode, started_at: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle(Mode),
    Busy(Mode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    EmptyPrompt,
    Busy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Completed(HistoryItem),
    Failed(String),
    Ignored(IgnoreReason),
}

#[derive(Debug)]
pub struct SessionState {
    canvas: Canvas,
    activity: Activity,
    last_error: Option<String>,
    /// Newest first.
    history: VecDeque<HistoryItem>,
    last_history_id: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            canvas: Canvas::Blank,
            activity: Activity::Idle,
            last_error: None,
            history: VecDeque::new(),
            last_history_id: 0,
        }
    }
}

impl SessionState {
    pub fn status(&self) -> Status {
        match self.activity {
            Activity::Idle => Status::Idle(self.canvas.mode()),
            Activity::Busy { mode, .. } => Status::Busy(mode),
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.activity, Activity::Busy { .. })
    }

    fn next_history_id(&mut self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let id = now.max(self.last_history_id + 1);
        self.last_history_id = id;
        id
    }

    fn record(&mut self, image: ImageRef, prompt: &str, limit: Option<usize>) -> HistoryItem {
        let item = HistoryItem {
            id: self.next_history_id(),
            image,
            prompt: prompt.to_string(),
            created_at: Utc::now(),
        };
        self.history.push_front(item.clone());
        if let Some(limit) = limit {
            self.history.truncate(limit);
        }
        item
    }

    fn snapshot(&self, id: Uuid) -> SessionSnapshot {
        SessionSnapshot {
            id,
            mode: self.canvas.mode(),
            is_loading: self.is_loading(),
            image: self.canvas.image().cloned(),
            last_error: self.last_error.clone(),
            history: self.history.iter().cloned().collect(),
        }
    }
}

enum Request {
    Generate,
    Edit(ImageRef),
}

/// One user's canvas: the state machine plus the channel the view watches.
///
/// Every mutation publishes a snapshot while still holding the state lock,
/// so subscribers only ever see whole transitions.
pub struct Session {
    id: Uuid,
    backend: Arc<dyn ImageBackend>,
    history_limit: Option<usize>,
    state: Mutex<SessionState>,
    notifier: watch::Sender<SessionSnapshot>,
}

impl Session {
    pub fn new(backend: Arc<dyn ImageBackend>, history_limit: Option<usize>) -> Self {
        let id = Uuid::new_v4();
        let state = SessionState::default();
        let (notifier, _) = watch::channel(state.snapshot(id));
        Self {
            id,
            backend,
            history_limit,
            state: Mutex::new(state),
            notifier,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.lock().snapshot(self.id)
    }

    pub fn status(&self) -> Status {
        self.state.lock().status()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.notifier.subscribe()
    }

    fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        self.notifier.send_replace(state.snapshot(self.id));
        result
    }

    /// Runs one prompt through the backend and applies the result.
    ///
    /// A result that resolves after `clear` or `select_history` still
    /// becomes the current image.
    pub async fn submit(&self, prompt: &str) -> SubmitOutcome {
        if prompt.trim().is_empty() {
            return SubmitOutcome::Ignored(IgnoreReason::EmptyPrompt);
        }

        let request = {
            let mut state = self.state.lock();
            if state.is_loading() {
                info!(session = %self.id, "submit ignored, request already in flight");
                return SubmitOutcome::Ignored(IgnoreReason::Busy);
            }
            let request = match &state.canvas {
                Canvas::Editing(image) => Request::Edit(image.clone()),
                Canvas::Blank => Request::Generate,
            };
            let mode = match request {
                Request::Generate => Mode::Generate,
                Request::Edit(_) => Mode::Edit,
            };
            state.activity = Activity::Busy { mode, started_at: Instant::now() };
            state.last_error = None;
            self.notifier.send_replace(state.snapshot(self.id));
            request
        };

        let mut in_flight = InFlight { session: self, settled: false };
        let result = match &request {
            Request::Edit(image) => self.backend.edit(image, prompt).await,
            Request::Generate => self.backend.generate(prompt).await,
        };
        in_flight.settled = true;

        self.update(|state| {
            if let Activity::Busy { mode, started_at } = state.activity {
                info!(session = %self.id, ?mode, elapsed_ms = started_at.elapsed().as_millis() as u64, "request settled");
            }
            state.activity = Activity::Idle;
            match result {
                Ok(image) => {
                    let item = state.record(image.clone(), prompt, self.history_limit);
                    state.canvas = Canvas::Editing(image);
                    SubmitOutcome::Completed(item)
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(session = %self.id, error = %message, "generation failed");
                    state.last_error = Some(message.clone());
                    SubmitOutcome::Failed(message)
                }
            }
        })
    }

    pub fn select_history(&self, item_id: u64) -> Result<(), SessionError> {
        self.update(|state| {
            let image = state
                .history
                .iter()
                .find(|item| item.id == item_id)
                .map(|item| item.image.clone())
                .ok_or(SessionError::HistoryItemNotFound(item_id))?;
            state.canvas = Canvas::Editing(image);
            Ok(())
        })
    }

    pub fn clear(&self) {
        self.update(|state| state.canvas = Canvas::Blank);
    }
}

/// Returns the session to idle if a submit is dropped before the backend
/// answers, so the busy flag cannot stick.
struct InFlight<'a> {
    session: &'a Session,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(session = %self.session.id, "submit dropped before completion");
            self.session.update(|state| state.activity = Activity::Idle);
        }
    }
}
