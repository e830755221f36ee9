use medibot_core::{
    Conversation, Embedding, EmbeddingProvider, EuclideanMatcher, MatchResult, Matcher, Message,
    ProviderError, Responder, UserRecord,
};
use medibot_store::{StoreError, UserStore};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no face detected in the image, try a clearer photo")]
    NoFaceDetected,
    #[error("face not recognized; a name is required to register")]
    NameRequired,
    #[error("this face is already registered as {user_id}")]
    AlreadyRegistered { user_id: String },
    #[error("embedding error: {0}")]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Whether repeating the same request may succeed (storage hiccup, not
    /// a bad request).
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Store(e) if e.is_persistence())
    }
}

/// How the session's user was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    Returning,
    Registered,
}

/// In-memory chat buffer for the resolved user. Nothing here is persisted
/// until [`Engine::save`].
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub id: Uuid,
    pub user_id: String,
    pub user_name: String,
    pub origin: SessionOrigin,
    pub messages: Vec<Message>,
    /// Width and height of the stored profile image, if it decodes.
    pub profile_image: Option<(u32, u32)>,
}

impl ChatSession {
    fn open(record: &UserRecord, origin: SessionOrigin, welcome: String) -> Self {
        let session = Self {
            id: Uuid::new_v4(),
            user_id: record.id.clone(),
            user_name: record.name.clone(),
            origin,
            messages: vec![Message::bot(welcome)],
            profile_image: profile_dimensions(record),
        };
        tracing::info!(
            session_id = %session.id,
            user_id = %session.user_id,
            origin = ?origin,
            "session started"
        );
        session
    }
}

/// Outcome of looking up the face in a login photo.
#[derive(Debug)]
pub enum Login<'a> {
    Returning(ChatSession),
    Unrecognized(UnknownFace<'a>),
}

/// A face that matched nobody, kept so registration can reuse its
/// embedding instead of running the models again.
#[derive(Debug)]
pub struct UnknownFace<'a> {
    embedding: Embedding,
    image: &'a [u8],
}

/// Ties the embedding provider, matcher, user store and responder together.
pub struct Engine<P> {
    provider: P,
    matcher: EuclideanMatcher,
    store: UserStore,
    responder: Responder,
    rng: StdRng,
}

impl<P: EmbeddingProvider> Engine<P> {
    pub fn new(provider: P, matcher: EuclideanMatcher, store: UserStore, responder: Responder) -> Self {
        Self {
            provider,
            matcher,
            store,
            responder,
            rng: StdRng::from_entropy(),
        }
    }

    /// Replace the template RNG (deterministic replies in tests).
    #[cfg(test)]
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn store(&self) -> &UserStore {
        &self.store
    }

    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    fn embed(&mut self, image: &[u8]) -> Result<Embedding, EngineError> {
        self.provider
            .extract(image)?
            .ok_or(EngineError::NoFaceDetected)
    }

    fn resolve(&self, embedding: &Embedding) -> Result<MatchResult, EngineError> {
        let gallery = self.store.gallery()?;
        let result = self.matcher.compare(embedding, &gallery);
        tracing::info!(
            matched = result.matched,
            distance = ?result.distance,
            user_id = ?result.user_id,
            gallery = gallery.len(),
            "identity resolved"
        );
        Ok(result)
    }

    /// Resolve the face in `image` against every enrolled embedding.
    pub fn identify(&mut self, image: &[u8]) -> Result<MatchResult, EngineError> {
        let embedding = self.embed(image)?;
        self.resolve(&embedding)
    }

    /// Register a new user from a photo. Refused when the face already
    /// matches someone.
    pub fn register(&mut self, name: &str, image: &[u8]) -> Result<UserRecord, EngineError> {
        let embedding = self.embed(image)?;
        if let Some(user_id) = self.resolve(&embedding)?.user_id {
            return Err(EngineError::AlreadyRegistered { user_id });
        }
        Ok(self.store.register(name, &embedding, Some(image))?)
    }

    /// Add another embedding for an existing user. Returns the new count.
    pub fn enroll(&mut self, user_id: &str, image: &[u8]) -> Result<usize, EngineError> {
        if !self.store.contains(user_id)? {
            return Err(StoreError::NotFound(user_id.to_string()).into());
        }
        let embedding = self.embed(image)?;
        Ok(self.store.add_embedding(user_id, &embedding)?)
    }

    /// Look up the face in `image`. A recognized face resumes as that user
    /// with a greeting; an unrecognized one is handed back for
    /// [`Engine::register_unknown`].
    pub fn begin<'a>(&mut self, image: &'a [u8]) -> Result<Login<'a>, EngineError> {
        let embedding = self.embed(image)?;
        match self.resolve(&embedding)?.user_id {
            Some(user_id) => {
                let record = self.store.load(&user_id)?;
                let greeting = self.responder.greeting(&record.name, &mut self.rng);
                Ok(Login::Returning(ChatSession::open(
                    &record,
                    SessionOrigin::Returning,
                    greeting,
                )))
            }
            None => Ok(Login::Unrecognized(UnknownFace {
                embedding,
                image,
            })),
        }
    }

    /// Register an unrecognized face under `name` and open its session.
    pub fn register_unknown(
        &mut self,
        face: UnknownFace<'_>,
        name: &str,
    ) -> Result<ChatSession, EngineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::NameRequired);
        }
        let record = self.store.register(name, &face.embedding, Some(face.image))?;
        let welcome = self.responder.registration_welcome(&record.name);
        Ok(ChatSession::open(&record, SessionOrigin::Registered, welcome))
    }

    /// Login-or-register in one step; `name` is required only when the
    /// face is not recognized.
    #[cfg(test)]
    pub fn start_session(
        &mut self,
        image: &[u8],
        name: Option<&str>,
    ) -> Result<ChatSession, EngineError> {
        match self.begin(image)? {
            Login::Returning(session) => Ok(session),
            Login::Unrecognized(face) => {
                self.register_unknown(face, name.ok_or(EngineError::NameRequired)?)
            }
        }
    }

    /// Append the user's line and the bot's reply to the buffer.
    pub fn reply(&mut self, session: &mut ChatSession, text: &str) -> String {
        let reply = self
            .responder
            .respond(text, &session.user_name, &mut self.rng);
        session.messages.push(Message::user(text));
        session.messages.push(Message::bot(reply.clone()));
        reply
    }

    /// Persist the current buffer as a new conversation entry.
    pub fn save(&mut self, session: &ChatSession) -> Result<Conversation, EngineError> {
        Ok(self
            .store
            .append_conversation(&session.user_id, &session.messages)?)
    }

    /// Discard the buffer and start over with a fresh greeting.
    pub fn new_conversation(&mut self, session: &mut ChatSession) {
        let greeting = self.responder.greeting(&session.user_name, &mut self.rng);
        session.messages = vec![Message::bot(greeting)];
    }

    /// Saved conversations, oldest first.
    pub fn history(&self, session: &ChatSession) -> Result<Vec<Conversation>, EngineError> {
        Ok(self.store.conversations(&session.user_id)?)
    }

    /// Replace the buffer with the `index`-th saved conversation.
    pub fn restore(&self, session: &mut ChatSession, index: usize) -> Result<(), EngineError> {
        session.messages = self.store.restore_conversation(&session.user_id, index)?;
        tracing::debug!(user_id = %session.user_id, index, "conversation restored");
        Ok(())
    }
}

fn profile_dimensions(record: &UserRecord) -> Option<(u32, u32)> {
    let bytes = record.profile_image.as_deref()?;
    match image::load_from_memory(bytes) {
        Ok(img) => Some((img.width(), img.height())),
        Err(e) => {
            tracing::warn!(user_id = %record.id, error = %e, "could not decode profile image");
            None
        }
    }
}
