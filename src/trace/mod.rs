mod eventbuf;
mod protocol;
mod reporter;
mod time_anchor;

pub use protocol::{
    BodyStreamData, CacheCallEndData, CacheCallStartData, DbQueryEndData, DbQueryStartData,
    EventType, LogMessageData, PublishEndData, PublishStartData, ServiceInitData, Tracer,
    TRACE_VERSION,
};
pub use reporter::{streaming_tracer, Reporter, ReporterConfig};
pub use time_anchor::TimeAnchor;
