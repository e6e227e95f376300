/// One intercepted exchange (or script result) with its source metadata
///
/// Produced by the interceptor, consumed exactly once by the pipeline consumer
/// of the route it was sent on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPayload {
    /// URL the body was loaded from (the page URL for script results)
    pub source_url: String,

    /// The pattern (or script marker) that matched
    pub matched_pattern: String,

    /// Raw response body
    pub body: Vec<u8>,
}

impl CapturedPayload {
    pub fn new(
        source_url: impl Into<String>,
        matched_pattern: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            matched_pattern: matched_pattern.into(),
            body: body.into(),
        }
    }

    /// Body length in bytes
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}
