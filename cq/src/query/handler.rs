//! Ordered query handler registry
//!
//! Handlers are tried in registration order; the first one that claims a
//! query produces the response and no later handler is consulted.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

type RespondFn = Arc<dyn Fn(&Bytes) -> Bytes + Send + Sync>;
type PredicateFn = Arc<dyn Fn(&str, &Bytes) -> Option<Bytes> + Send + Sync>;

/// A locally registered capability able to answer queries
#[derive(Clone)]
pub enum QueryHandler {
    /// Claims exactly one query type and always answers it
    Typed { query_type: String, respond: RespondFn },

    /// Inspects any query and claims it by returning `Some(response)`
    Predicate(PredicateFn),
}

impl QueryHandler {
    pub fn typed<F>(query_type: impl Into<String>, respond: F) -> Self
    where
        F: Fn(&Bytes) -> Bytes + Send + Sync + 'static,
    {
        QueryHandler::Typed {
            query_type: query_type.into(),
            respond: Arc::new(respond),
        }
    }

    pub fn predicate<F>(handle: F) -> Self
    where
        F: Fn(&str, &Bytes) -> Option<Bytes> + Send + Sync + 'static,
    {
        QueryHandler::Predicate(Arc::new(handle))
    }

    /// Try to answer; `None` means "not claimed"
    pub fn try_handle(&self, query_type: &str, payload: &Bytes) -> Option<Bytes> {
        match self {
            QueryHandler::Typed {
                query_type: claimed,
                respond,
            } => (claimed == query_type).then(|| respond(payload)),
            QueryHandler::Predicate(handle) => handle(query_type, payload),
        }
    }
}

impl fmt::Debug for QueryHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryHandler::Typed { query_type, .. } => f.debug_struct("Typed").field("query_type", query_type).finish(),
            QueryHandler::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

/// Handlers in registration order
#[derive(Debug, Default, Clone)]
pub struct HandlerRegistry {
    handlers: Vec<QueryHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handler: QueryHandler) {
        debug!(?handler, position = self.handlers.len(), "HandlerRegistry::push: called");
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Walk the handlers in order and return the first claimed response
    pub fn dispatch(&self, query_type: &str, payload: &Bytes) -> Option<Bytes> {
        self.handlers.iter().find_map(|h| h.try_handle(query_type, payload))
    }
}
