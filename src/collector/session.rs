//! The per-unit-of-work event collector.
//!
//! A `Session` is created when a sampled unit of work begins, receives
//! queries, method enter/exit pairs and renders from the instrumentation
//! layer, and is turned into a `Profile` exactly once on finish.
//!
//! Lifecycle: `Created -> Active -> Finished`. Events arriving after
//! finish are ignored, and later `finish` calls return the cached profile.
//!
//! A session is bound to the thread that started it and is deliberately
//! not `Send`.

use super::context;
use crate::aggregator::assembler::{AssemblyInput, ProfileAssembler};
use crate::aggregator::hotspots::{normalize_template, split_qualified, HotspotAccumulator};
use crate::model::event::{
    model_from_query_name, Event, MethodCall, MethodCategory, MethodDescriptor, Query, RenderEvent,
};
use crate::model::schema::{Profile, RequestMetadata};
use crate::utils::clock::{elapsed_ms, epoch_seconds, Clock};
use crate::utils::config::ProfilerConfig;
use crate::utils::error::CollectorError;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    Finished,
}

/// Which event kinds a session records
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub track_queries: bool,
    pub track_code: bool,
    pub track_memory: bool,
    pub app_root: Option<PathBuf>,
}

impl SessionOptions {
    /// Record everything
    pub fn all() -> Self {
        Self {
            track_queries: true,
            track_code: true,
            track_memory: true,
            app_root: None,
        }
    }
}

impl From<&ProfilerConfig> for SessionOptions {
    fn from(config: &ProfilerConfig) -> Self {
        Self {
            track_queries: config.track_queries,
            track_code: config.track_code,
            track_memory: config.track_memory,
            app_root: config.app_root.clone(),
        }
    }
}

/// Handle returned by method entry, consumed by method exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeToken(u64);

/// An in-flight method on the call stack
#[derive(Debug)]
struct Frame {
    token: ScopeToken,
    descriptor: MethodDescriptor,
    category: MethodCategory,
    parent: Option<(ScopeToken, String)>,
    entered_at: DateTime<Utc>,
    /// Time spent in nested methods, queries and renders
    child_time: f64,
}

/// Mutable accumulator for one unit of work
pub struct Session {
    id: String,
    metadata: RequestMetadata,
    options: SessionOptions,
    clock: Arc<dyn Clock>,
    state: SessionState,
    started_at: DateTime<Utc>,
    stack: Vec<Frame>,
    next_token: u64,
    events: Vec<Event>,
    db_time: f64,
    view_time: f64,
    controller_time: f64,
    hotspots: HotspotAccumulator,
    profile: Option<Profile>,
    _not_send: PhantomData<Rc<()>>,
}

impl Session {
    /// Create a session without registering it
    pub fn new(
        id: impl Into<String>,
        metadata: RequestMetadata,
        options: SessionOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let started_at = clock.now();
        Self {
            id: id.into(),
            metadata,
            options,
            clock,
            state: SessionState::Created,
            started_at,
            stack: Vec::new(),
            next_token: 0,
            events: Vec::new(),
            db_time: 0.0,
            view_time: 0.0,
            controller_time: 0.0,
            hotspots: HotspotAccumulator::new(),
            profile: None,
            _not_send: PhantomData,
        }
    }

    /// Create, register and activate a session
    ///
    /// **Public** - entry point of the ingestion API
    ///
    /// # Errors
    /// `DuplicateSession` if `id` is already active on this thread
    pub fn start(
        id: impl Into<String>,
        metadata: RequestMetadata,
        options: SessionOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CollectorError> {
        let mut session = Self::new(id, metadata, options, clock);
        session.activate()?;
        Ok(session)
    }

    /// Register this session as the thread's active one
    pub fn activate(&mut self) -> Result<(), CollectorError> {
        if self.state != SessionState::Created {
            return Ok(());
        }
        context::register(&self.id)?;
        self.started_at = self.clock.now();
        self.state = SessionState::Active;
        debug!("[profiler] Session {} started", self.id);
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == SessionState::Finished
    }

    pub fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }

    /// Number of methods currently on the call stack
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// The assembled profile, once finished
    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    /// Fill in routing results known only after dispatch
    pub fn set_controller_info(&mut self, controller: impl Into<String>, action: impl Into<String>) {
        if self.accepting("controller info") {
            self.metadata.controller = Some(controller.into());
            self.metadata.action = Some(action.into());
        }
    }

    fn accepting(&self, what: &str) -> bool {
        match self.state {
            SessionState::Active => true,
            SessionState::Created => {
                debug!("[profiler] Session {} not active, ignoring {}", self.id, what);
                false
            }
            SessionState::Finished => {
                debug!("[profiler] Session {} finished, ignoring {}", self.id, what);
                false
            }
        }
    }

    /// Attribute nested time to whatever method is on top of the stack
    fn charge_parent(&mut self, duration: f64) {
        if let Some(top) = self.stack.last_mut() {
            top.child_time += duration;
        }
    }

    /// Record a database query
    ///
    /// # Arguments
    /// * `sql` - Statement text
    /// * `name` - Adapter label; `"<Model> Load"` style labels credit the model
    /// * `duration` - Milliseconds
    /// * `started_at` - Epoch seconds
    pub fn record_query(&mut self, sql: &str, name: Option<&str>, duration: f64, started_at: f64) {
        if !self.options.track_queries || !self.accepting("query") {
            return;
        }

        self.db_time += duration;
        self.charge_parent(duration);
        if let Some(model) = name.and_then(model_from_query_name) {
            self.hotspots.credit_model(model, duration);
        }

        self.events.push(Event::Query(Query {
            sql: sql.to_string(),
            name: name.map(str::to_string),
            duration,
            started_at,
            backtrace: None,
        }));
    }

    /// Push a method onto the call stack
    ///
    /// The returned token must be handed to `record_method_exit` on every
    /// path out of the method; `enter` wraps this in a guard that does so.
    pub fn record_method_enter(&mut self, descriptor: MethodDescriptor) -> ScopeToken {
        let token = ScopeToken(self.next_token);
        self.next_token += 1;

        if !self.options.track_code || !self.accepting("method entry") {
            return token;
        }

        let category = descriptor.resolved_category();
        let parent = self
            .stack
            .last()
            .map(|frame| (frame.token, frame.descriptor.name.clone()));
        self.stack.push(Frame {
            token,
            descriptor,
            category,
            parent,
            entered_at: self.clock.now(),
            child_time: 0.0,
        });
        token
    }

    /// Pop a method off the call stack
    pub fn record_method_exit(&mut self, token: ScopeToken) {
        self.exit_frame(token, None);
    }

    /// Pop a method off the call stack, recording its memory growth in KB
    pub fn record_method_exit_with_memory(&mut self, token: ScopeToken, memory_delta_kb: i64) {
        let delta = self.options.track_memory.then_some(memory_delta_kb);
        self.exit_frame(token, delta);
    }

    fn exit_frame(&mut self, token: ScopeToken, memory_delta: Option<i64>) {
        if !self.options.track_code || self.state != SessionState::Active {
            return;
        }
        let Some(position) = self.stack.iter().rposition(|frame| frame.token == token) else {
            debug!("[profiler] Session {}: exit for unknown scope {:?}", self.id, token);
            return;
        };

        // Frames above the token missed their own exit
        for leaked in self.stack.drain(position + 1..) {
            warn!(
                "[profiler] Session {}: {} exited without release, discarding",
                self.id, leaked.descriptor.name
            );
        }
        let Some(frame) = self.stack.pop() else {
            return;
        };

        let now = self.clock.now();
        let duration = elapsed_ms(frame.entered_at, now);
        let exclusive = (duration - frame.child_time).max(0.0);
        self.charge_parent(duration);

        let name = frame.descriptor.name;
        let (parent_id, parent) = match frame.parent {
            Some((ScopeToken(id), parent)) => (Some(id), Some(parent)),
            None => (None, None),
        };
        self.hotspots.credit_method(&name, duration, exclusive);
        match frame.category {
            MethodCategory::Controller => {
                self.controller_time += exclusive;
                let (controller, action) = split_qualified(&name);
                self.hotspots.credit_controller(controller, action, duration);
            }
            MethodCategory::Model => {
                let (model, _) = split_qualified(&name);
                self.hotspots.credit_model(model, exclusive);
            }
            _ => {}
        }

        self.events.push(Event::MethodCall(MethodCall {
            id: Some(frame.token.0),
            parent_id,
            name,
            method_name: frame.descriptor.method_name,
            category: frame.category,
            file: frame.descriptor.file,
            line: frame.descriptor.line,
            duration,
            exclusive_duration: exclusive,
            parent,
            started_at: epoch_seconds(frame.entered_at),
            memory_delta,
            backtrace: frame.descriptor.backtrace,
        }));
    }

    /// Enter a method and get a guard that exits it when dropped
    pub fn enter(&mut self, descriptor: MethodDescriptor) -> MethodGuard<'_> {
        let token = self.record_method_enter(descriptor);
        MethodGuard {
            session: self,
            token,
        }
    }

    /// Record a template render
    ///
    /// # Arguments
    /// * `template_id` - Template path or identifier
    /// * `duration` - Milliseconds
    pub fn record_render(&mut self, template_id: &str, duration: f64) {
        if !self.options.track_code || !self.accepting("render") {
            return;
        }

        self.view_time += duration;
        self.charge_parent(duration);
        let key = normalize_template(template_id, self.options.app_root.as_deref());
        self.hotspots.credit_view(&key, duration);

        let started_at = epoch_seconds(self.clock.now()) - duration / 1000.0;
        self.events.push(Event::Render(RenderEvent {
            template_id: template_id.to_string(),
            category: "view".to_string(),
            duration,
            started_at,
        }));
    }

    /// Finish the session and assemble its profile
    ///
    /// **Public** - idempotent; later calls return the cached profile
    ///
    /// # Arguments
    /// * `status` - Response status; below 100 marks a non-HTTP event
    /// * `total_duration` - Milliseconds; derived from the clock when absent
    pub fn finish(&mut self, status: u16, total_duration: Option<f64>) -> Profile {
        if let Some(profile) = &self.profile {
            return profile.clone();
        }

        if !self.stack.is_empty() {
            warn!(
                "[profiler] Session {} finished with {} open method(s)",
                self.id,
                self.stack.len()
            );
            self.stack.clear();
        }

        let duration =
            total_duration.unwrap_or_else(|| elapsed_ms(self.started_at, self.clock.now()));

        let profile = ProfileAssembler::new().assemble(AssemblyInput {
            request_id: self.id.clone(),
            metadata: self.metadata.clone(),
            status,
            started_at: epoch_seconds(self.started_at),
            duration,
            db_time: self.db_time,
            view_time: self.view_time,
            controller_time: self.controller_time,
            events: std::mem::take(&mut self.events),
            hotspots: std::mem::take(&mut self.hotspots),
        });

        info!(
            "[profiler] Session {} finished: {} {} ({}), {:.2}ms",
            self.id, profile.method, profile.path, profile.status, profile.duration
        );

        self.state = SessionState::Finished;
        context::release(&self.id);
        self.profile = Some(profile.clone());
        profile
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Only an active session owns the registry entry
        if self.state == SessionState::Active {
            context::release(&self.id);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("depth", &self.stack.len())
            .field("events", &self.events.len())
            .finish()
    }
}

/// Exits its method when dropped, on every path out of the scope
pub struct MethodGuard<'a> {
    session: &'a mut Session,
    token: ScopeToken,
}

impl MethodGuard<'_> {
    pub fn token(&self) -> ScopeToken {
        self.token
    }
}

impl Deref for MethodGuard<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for MethodGuard<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for MethodGuard<'_> {
    fn drop(&mut self) {
        self.session.record_method_exit(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn setup(id: &str) -> (Session, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let session = Session::start(
            id,
            RequestMetadata::new("GET", "/users"),
            SessionOptions::all(),
            Arc::new(clock.clone()),
        )
        .unwrap();
        (session, clock)
    }

    #[test]
    fn test_duplicate_session_rejected() {
        let (session, clock) = setup("dup");
        let second = Session::start(
            "dup",
            RequestMetadata::default(),
            SessionOptions::all(),
            Arc::new(clock),
        );
        assert_eq!(
            second.err(),
            Some(CollectorError::DuplicateSession("dup".to_string()))
        );
        drop(session);
        assert!(context::current().is_none());
    }

    #[test]
    fn test_exclusive_time_excludes_children() {
        let (mut session, clock) = setup("excl");

        let outer = session.record_method_enter(MethodDescriptor::new("UsersController#index"));
        clock.advance(Duration::milliseconds(10));
        let inner = session.record_method_enter(MethodDescriptor::new("UserService#load"));
        clock.advance(Duration::milliseconds(30));
        session.record_method_exit(inner);
        session.record_query("SELECT 1", Some("User Load"), 5.0, 0.0);
        clock.advance(Duration::milliseconds(5));
        session.record_method_exit(outer);

        let profile = session.finish(200, Some(60.0));
        let calls: Vec<&MethodCall> = profile
            .additional_data
            .events
            .iter()
            .filter_map(|e| match e {
                Event::MethodCall(m) => Some(m),
                _ => None,
            })
            .collect();

        assert_eq!(calls[0].name, "UserService#load");
        assert_eq!(calls[0].parent.as_deref(), Some("UsersController#index"));
        assert_eq!(calls[0].parent_id, calls[1].id);
        assert_eq!(calls[1].parent_id, None);
        assert_eq!(calls[0].exclusive_duration, 30.0);
        assert_eq!(calls[1].duration, 45.0);
        assert_eq!(calls[1].exclusive_duration, 10.0);
        assert_eq!(profile.controller_time, 10.0);
        assert_eq!(profile.db_time, 5.0);
        assert_eq!(profile.ruby_time, 45.0);
        assert_eq!(profile.additional_data.hotspots.models[0].name, "User");
    }

    #[test]
    fn test_guard_exits_on_early_return() {
        let (mut session, clock) = setup("guard");

        fn instrumented(session: &mut Session, clock: &ManualClock) -> Result<(), &'static str> {
            let _guard = session.enter(MethodDescriptor::new("Billing#charge"));
            clock.advance(Duration::milliseconds(3));
            Err("card declined")
        }

        assert!(instrumented(&mut session, &clock).is_err());
        assert_eq!(session.depth(), 0);
        assert_eq!(session.events().len(), 1);
    }

    #[test]
    fn test_leaked_frames_are_popped() {
        let (mut session, _clock) = setup("leak");
        let outer = session.record_method_enter(MethodDescriptor::new("A#run"));
        let _never_exited = session.record_method_enter(MethodDescriptor::new("B#run"));
        session.record_method_exit(outer);

        assert_eq!(session.depth(), 0);
        assert_eq!(session.events().len(), 1);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let (mut session, clock) = setup("idem");
        session.record_render("/app/views/users/index.html.erb", 12.0);
        clock.advance(Duration::milliseconds(40));

        let first = session.finish(200, None);
        session.record_query("SELECT 2", None, 99.0, 0.0);
        clock.advance(Duration::milliseconds(40));
        let second = session.finish(500, None);

        assert_eq!(first, second);
        assert_eq!(first.duration, 40.0);
        assert_eq!(first.view_time, 12.0);
        assert_eq!(session.state(), SessionState::Finished);
        assert!(context::current().is_none());
    }

    #[test]
    fn test_tracking_switches() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let mut session = Session::start(
            "quiet",
            RequestMetadata::new("GET", "/"),
            SessionOptions::default(),
            Arc::new(clock),
        )
        .unwrap();

        session.record_query("SELECT 1", None, 4.0, 0.0);
        {
            let _guard = session.enter(MethodDescriptor::new("A#b"));
        }
        session.record_render("index", 2.0);

        let profile = session.finish(200, Some(10.0));
        assert!(profile.queries.is_empty());
        assert!(profile.additional_data.events.is_empty());
        assert_eq!(profile.ruby_time, 10.0);
    }

    #[test]
    fn test_controller_info_names_endpoint() {
        let (mut session, _clock) = setup("routing");
        session.set_controller_info("UsersController", "index");
        let profile = session.finish(200, Some(5.0));
        assert_eq!(profile.endpoint_name, "UsersController#index");
    }
}
