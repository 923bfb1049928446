/// Anchors monotonic event timestamps to wall-clock time, so the
/// collector can reconstruct absolute times from relative ones.
#[derive(Debug, Clone)]
pub struct TimeAnchor {
    pub instant: tokio::time::Instant,
    pub system: std::time::SystemTime,
}

impl TimeAnchor {
    pub fn new() -> Self {
        Self {
            instant: tokio::time::Instant::now(),
            system: std::time::SystemTime::now(),
        }
    }

    /// The anchor header value: unix nanos of the anchor point.
    pub fn trace_header(&self) -> String {
        let nanos = self
            .system
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        nanos.to_string()
    }
}

impl Default for TimeAnchor {
    fn default() -> Self {
        Self::new()
    }
}
