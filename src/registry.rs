//! Handler registry: maps an action to the executor that performs it.
//!
//! The queue never knows how to perform an action. The sync engine
//! resolves the item's action here on every attempt, so new action
//! types only need a registration at startup.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::HandlerError;
use crate::queue::Payload;

/// Mutations the client knows how to queue.
///
/// `Other` carries action names from newer or plugin-provided producers.
/// Those resolve only if something registered the exact name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
  UpdatePhaseStatus,
  ToggleChecklistItem,
  CreateChangeOrder,
  AddDailyLog,
  VoiceCommand,
  Other(String),
}

impl Action {
  /// Every statically known action.
  pub const KNOWN: [Action; 5] = [
    Action::UpdatePhaseStatus,
    Action::ToggleChecklistItem,
    Action::CreateChangeOrder,
    Action::AddDailyLog,
    Action::VoiceCommand,
  ];

  pub fn as_str(&self) -> &str {
    match self {
      Action::UpdatePhaseStatus => "update_phase_status",
      Action::ToggleChecklistItem => "toggle_checklist_item",
      Action::CreateChangeOrder => "create_change_order",
      Action::AddDailyLog => "add_daily_log",
      Action::VoiceCommand => "voice_command",
      Action::Other(name) => name,
    }
  }

  /// Parse a stored or user-supplied action name. Never fails.
  pub fn from_name(name: &str) -> Self {
    Action::KNOWN
      .into_iter()
      .find(|known| known.as_str() == name)
      .unwrap_or_else(|| Action::Other(name.to_string()))
  }
}

impl std::fmt::Display for Action {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Executes one action against the server.
///
/// Implementations should be idempotent: an ambiguous attempt (timeout
/// after the server applied the change) is retried.
pub trait Handler: Send + Sync {
  fn execute<'a>(&'a self, payload: &'a Payload) -> BoxFuture<'a, Result<(), HandlerError>>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F>(F);

/// Wrap a closure taking an owned payload as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
  F: Fn(Payload) -> Fut + Send + Sync,
  Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
  FnHandler(f)
}

impl<F, Fut> Handler for FnHandler<F>
where
  F: Fn(Payload) -> Fut + Send + Sync,
  Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
  fn execute<'a>(&'a self, payload: &'a Payload) -> BoxFuture<'a, Result<(), HandlerError>> {
    Box::pin((self.0)(payload.clone()))
  }
}

/// Registry of handlers, filled once at startup.
#[derive(Clone, Default)]
pub struct Registry {
  handlers: HashMap<Action, Arc<dyn Handler>>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a handler built by `make` for every statically known action.
  pub fn with_known<F>(mut make: F) -> Self
  where
    F: FnMut(&Action) -> Arc<dyn Handler>,
  {
    let mut registry = Self::new();
    for action in Action::KNOWN {
      let handler = make(&action);
      registry.register(action, handler);
    }
    registry
  }

  /// Register (or replace) the handler for an action.
  pub fn register(&mut self, action: Action, handler: Arc<dyn Handler>) -> &mut Self {
    self.handlers.insert(action, handler);
    self
  }

  pub fn resolve(&self, action: &Action) -> Option<Arc<dyn Handler>> {
    self.handlers.get(action).cloned()
  }

  pub fn len(&self) -> usize {
    self.handlers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.handlers.is_empty()
  }
}

impl std::fmt::Debug for Registry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut actions: Vec<_> = self.handlers.keys().map(Action::as_str).collect();
    actions.sort_unstable();
    f.debug_struct("Registry").field("actions", &actions).finish()
  }
}
