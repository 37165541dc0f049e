//! Fold registry: typed per-event-type handlers over a state value.
//!
//! A [`Fold`] decodes each event's `data` into the payload type registered
//! for its `event_type`, so handler code works with concrete types. The
//! managers hold folds behind [`StateFold`], which stores state as JSON so
//! read-model and snapshot stores stay schema-free.

use std::collections::HashMap;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::events::Event;

type Handler<S> = Box<dyn Fn(&mut S, &Event) -> Result<()> + Send + Sync>;

/// Event handlers for one state type.
pub struct Fold<S> {
    name: String,
    handlers: HashMap<String, Handler<S>>,
    fallback: Option<Handler<S>>,
}

impl<S: 'static> Fold<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: HashMap::new(),
            fallback: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle `event_type` by decoding its payload as `P`.
    pub fn on<P, F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + 'static,
        F: Fn(&mut S, P, &Event) + Send + Sync + 'static,
    {
        let fold = self.name.clone();
        self.handlers.insert(
            event_type.into(),
            Box::new(move |state: &mut S, event: &Event| {
                let payload: P =
                    serde_json::from_value(event.data.clone()).map_err(|e| Error::Fold {
                        fold: fold.clone(),
                        event_type: event.event_type.clone(),
                        reason: e.to_string(),
                    })?;
                handler(state, payload, event);
                Ok(())
            }),
        );
        self
    }

    /// Handle every event type without a dedicated handler.
    pub fn on_any<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut S, &Event) + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(move |state: &mut S, event: &Event| {
            handler(state, event);
            Ok(())
        }));
        self
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.fallback.is_some() || self.handlers.contains_key(event_type)
    }

    /// Apply one event. Returns `false` when no handler matched.
    pub fn apply(&self, state: &mut S, event: &Event) -> Result<bool> {
        match self
            .handlers
            .get(&event.event_type)
            .or(self.fallback.as_ref())
        {
            Some(handler) => {
                handler(state, event)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// A fold over JSON state, as used by the projection and snapshot managers.
pub trait StateFold: Send + Sync {
    fn name(&self) -> &str;

    fn handles(&self, event_type: &str) -> bool;

    /// State before any event is applied.
    fn initial(&self) -> Result<Value>;

    fn apply(&self, state: Value, event: &Event) -> Result<Value>;
}

/// Adapts a typed [`Fold`] to [`StateFold`].
pub struct TypedFold<S> {
    fold: Fold<S>,
    _state: PhantomData<fn() -> S>,
}

impl<S> TypedFold<S>
where
    S: Default + Serialize + DeserializeOwned + 'static,
{
    pub fn new(fold: Fold<S>) -> Self {
        Self {
            fold,
            _state: PhantomData,
        }
    }

    pub fn fold(&self) -> &Fold<S> {
        &self.fold
    }

    /// Decode JSON state produced by this fold.
    pub fn decode(&self, state: Value) -> Result<S> {
        Ok(serde_json::from_value(state)?)
    }
}

impl<S> StateFold for TypedFold<S>
where
    S: Default + Serialize + DeserializeOwned + 'static,
{
    fn name(&self) -> &str {
        self.fold.name()
    }

    fn handles(&self, event_type: &str) -> bool {
        self.fold.handles(event_type)
    }

    fn initial(&self) -> Result<Value> {
        Ok(serde_json::to_value(S::default())?)
    }

    fn apply(&self, state: Value, event: &Event) -> Result<Value> {
        if !self.fold.handles(&event.event_type) {
            return Ok(state);
        }
        let mut typed: S = serde_json::from_value(state)?;
        self.fold.apply(&mut typed, event)?;
        Ok(serde_json::to_value(typed)?)
    }
}

impl<S> From<Fold<S>> for TypedFold<S>
where
    S: Default + Serialize + DeserializeOwned + 'static,
{
    fn from(fold: Fold<S>) -> Self {
        TypedFold::new(fold)
    }
}
