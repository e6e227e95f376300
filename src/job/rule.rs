use crate::browser::UrlPattern;
use crate::document::DocumentConverter;
use std::fmt;
use std::sync::Arc;

/// Default number of payloads an output channel buffers before the
/// producing interceptor stalls
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Where captured payloads go: a named channel with an optional converter
///
/// Without a converter the route is observe-only: payloads are logged and
/// counted, never persisted.
#[derive(Clone)]
pub struct OutputRoute {
    /// Channel identifier, used in logs and reports
    pub name: String,

    /// Buffered capacity of the channel
    pub capacity: usize,

    /// Turns raw payloads into documents
    pub converter: Option<Arc<dyn DocumentConverter>>,
}

impl OutputRoute {
    /// Creates an observe-only route
    pub fn observe(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: DEFAULT_CHANNEL_CAPACITY,
            converter: None,
        }
    }

    /// Creates a route whose payloads are converted and indexed
    pub fn indexed(name: impl Into<String>, converter: Arc<dyn DocumentConverter>) -> Self {
        Self {
            name: name.into(),
            capacity: DEFAULT_CHANNEL_CAPACITY,
            converter: Some(converter),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn is_observe_only(&self) -> bool {
        self.converter.is_none()
    }

    /// Whether both routes convert with the same converter instance
    pub fn same_converter(&self, other: &OutputRoute) -> bool {
        match (&self.converter, &other.converter) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const (),
            _ => false,
        }
    }
}

impl fmt::Debug for OutputRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputRoute")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("converter", &self.converter.is_some())
            .finish()
    }
}

/// A URL pattern whose matching exchanges are routed to an output
#[derive(Debug, Clone)]
pub struct InterceptRule {
    pub pattern: UrlPattern,
    pub route: OutputRoute,
}

impl InterceptRule {
    pub fn new(pattern: impl Into<UrlPattern>, route: OutputRoute) -> Self {
        Self {
            pattern: pattern.into(),
            route,
        }
    }
}
