use crate::log::fields::FieldConfig;
use crate::log::writers::{BlockingWriter, Writer};
use crate::model;
use crate::trace::{LogMessageData, Tracer};
use anyhow::Context;
use env_logger::filter::Filter;
use log::{Log, Metadata, Record};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

pub type Fields = BTreeMap<String, serde_json::Value>;

/// A structured JSON logger.
///
/// Application records go to the configured writer as JSONL and, when a
/// request is in scope, into the trace as LogMessage events.
#[derive(Debug, Clone)]
pub struct Logger {
    filter: Arc<Filter>,
    app_level: log::LevelFilter,
    field_config: &'static FieldConfig,
    writer: Arc<dyn Writer>,
    extra_fields: Fields,
    tracer: Arc<RwLock<Tracer>>,
}

impl Logger {
    pub fn new(
        app_level: log::LevelFilter,
        filter: Filter,
        field_config: &'static FieldConfig,
    ) -> Self {
        Self {
            filter: Arc::new(filter),
            app_level,
            field_config,
            writer: Arc::new(BlockingWriter::default()),
            extra_fields: Fields::new(),
            tracer: Arc::new(RwLock::new(Tracer::noop())),
        }
    }

    pub fn set_tracer(&self, tracer: Tracer) {
        let mut t = self.tracer.write().expect("tracer lock poisoned");
        *t = tracer;
    }

    /// Returns a new logger with the given log level.
    pub fn with_level(&self, level: log::LevelFilter) -> Self {
        Self {
            app_level: level,
            ..self.clone()
        }
    }

    /// Returns a new logger with the given writer.
    pub fn with_writer(&self, writer: Arc<dyn Writer>) -> Self {
        Self {
            writer,
            ..self.clone()
        }
    }

    /// Returns a new logger that attaches the given fields to every record.
    pub fn with(&self, fields: Fields) -> Self {
        let mut replacement = self.clone();
        for (key, value) in fields {
            replacement.extra_fields.insert(key, value);
        }
        replacement
    }

    pub fn trace(&self, req: Option<&model::Request>, msg: &str, fields: Option<Fields>) {
        self.log_at(log::Level::Trace, req, msg, None, fields);
    }

    pub fn debug(&self, req: Option<&model::Request>, msg: &str, fields: Option<Fields>) {
        self.log_at(log::Level::Debug, req, msg, None, fields);
    }

    pub fn info(&self, req: Option<&model::Request>, msg: &str, fields: Option<Fields>) {
        self.log_at(log::Level::Info, req, msg, None, fields);
    }

    pub fn warn(
        &self,
        req: Option<&model::Request>,
        msg: &str,
        error: Option<&crate::api::Error>,
        fields: Option<Fields>,
    ) {
        self.log_at(log::Level::Warn, req, msg, error, fields);
    }

    pub fn error(
        &self,
        req: Option<&model::Request>,
        msg: &str,
        error: Option<&crate::api::Error>,
        fields: Option<Fields>,
    ) {
        self.log_at(log::Level::Error, req, msg, error, fields);
    }

    fn log_at(
        &self,
        level: log::Level,
        req: Option<&model::Request>,
        msg: &str,
        error: Option<&crate::api::Error>,
        fields: Option<Fields>,
    ) {
        if level > self.app_level {
            return;
        }
        if let Err(err) = self.try_log(req, level, msg.to_string(), error, None, fields) {
            eprintln!("failed to log: {}", err);
        }
    }

    fn level_value(&self, level: log::Level) -> serde_json::Value {
        serde_json::Value::from(match level {
            log::Level::Trace => self.field_config.level_trace_value,
            log::Level::Debug => self.field_config.level_debug_value,
            log::Level::Info => self.field_config.level_info_value,
            log::Level::Warn => self.field_config.level_warn_value,
            log::Level::Error => self.field_config.level_error_value,
        })
    }

    fn try_log(
        &self,
        request: Option<&model::Request>,
        level: log::Level,
        msg: String,
        error: Option<&crate::api::Error>,
        caller: Option<String>,
        fields: Option<Fields>,
    ) -> anyhow::Result<()> {
        let mut values = self.extra_fields.clone();

        if let Some(fields) = fields {
            values.extend(fields);
        }

        if let Some(caller) = caller {
            values.insert(
                self.field_config.caller_field_name.to_string(),
                serde_json::Value::from(caller),
            );
        }

        if let Some(error) = error {
            values.insert(
                self.field_config.error_field_name.to_string(),
                serde_json::Value::from(error.to_string()),
            );
        }

        values.insert(
            self.field_config.level_field_name.to_string(),
            self.level_value(level),
        );
        values.insert(
            self.field_config.timestamp_field_name.to_string(),
            iso8601_now(),
        );
        values.insert(
            self.field_config.message_field_name.to_string(),
            serde_json::Value::from(msg.clone()),
        );

        if let Some(req) = request {
            match &req.data {
                model::RequestData::Rpc(rpc) => {
                    let ep = &rpc.endpoint_name;
                    values.insert("service".into(), ep.service().into());
                    values.insert("endpoint".into(), ep.endpoint().into());
                    if let Some(uid) = &rpc.auth_user_id {
                        values.insert("uid".into(), uid.clone().into());
                    }
                }
                model::RequestData::Auth(auth) => {
                    let ep = &auth.auth_handler;
                    values.insert("service".into(), ep.service().into());
                    values.insert("endpoint".into(), ep.endpoint().into());
                }
                model::RequestData::PubSub(msg_data) => {
                    values.insert("service".into(), msg_data.service.as_str().into());
                    values.insert("topic".into(), msg_data.topic.as_str().into());
                    values.insert(
                        "subscription".into(),
                        msg_data.subscription.as_str().into(),
                    );
                }
            };

            values.insert("trace_id".into(), req.span.0.serialize().into());
            values.insert("span_id".into(), req.span.1.serialize().into());

            if let Some(corr_id) = &req.ext_correlation_id {
                values.insert("x_correlation_id".into(), corr_id.clone().into());
            } else if let Some(parent_trace) = &req.parent_trace {
                values.insert("x_correlation_id".into(), parent_trace.serialize().into());
            }
        }

        self.write_to_trace(request, level, &msg, &values);

        self.writer.write(level, &values).context("unable to write")
    }

    fn try_log_record(&self, record: &Record) -> anyhow::Result<()> {
        let kvs = record.key_values();
        let mut visitor = KeyValueVisitor(BTreeMap::new());
        let _ = kvs.visit(&mut visitor);

        let msg = match record.args().as_str() {
            Some(msg) => msg.to_string(),
            None => record.args().to_string(),
        };

        let caller = match (record.module_path(), record.file(), record.line()) {
            (Some(module), _, _) => Some(module.to_string()),
            (_, Some(file), Some(line)) => Some(format!("{}:{}", file, line)),
            _ => None,
        };

        self.try_log(None, record.level(), msg, None, caller, Some(visitor.0))
    }

    fn write_to_trace(
        &self,
        request: Option<&model::Request>,
        level: log::Level,
        msg: &str,
        fields: &Fields,
    ) {
        let mut trace_fields = Vec::new();

        for (key, val) in fields.iter() {
            match val {
                serde_json::Value::Number(num) => {
                    if let Some(v) = num.as_i64() {
                        trace_fields.push(model::LogField {
                            key,
                            value: model::LogFieldValue::I64(v),
                        });
                    } else if let Some(v) = num.as_u64() {
                        trace_fields.push(model::LogField {
                            key,
                            value: model::LogFieldValue::U64(v),
                        });
                    } else if let Some(v) = num.as_f64() {
                        trace_fields.push(model::LogField {
                            key,
                            value: model::LogFieldValue::F64(v),
                        });
                    }
                }
                serde_json::Value::Bool(b) => trace_fields.push(model::LogField {
                    key,
                    value: model::LogFieldValue::Bool(*b),
                }),
                serde_json::Value::String(str) => trace_fields.push(model::LogField {
                    key,
                    value: model::LogFieldValue::String(str),
                }),
                _ => {}
            }
        }

        self.tracer
            .read()
            .expect("tracer lock poisoned")
            .log_message(LogMessageData {
                source: request,
                msg,
                level: level.into(),
                fields: trace_fields,
            });
    }
}

#[inline]
fn iso8601_now() -> serde_json::Value {
    let now = SystemTime::now();
    let date = chrono::DateTime::<chrono::Utc>::from(now);
    serde_json::Value::from(date.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}

/// Lets crates that use the `log` facade emit through our structured logger.
impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.filter.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.try_log_record(record).unwrap_or_else(|e| {
                eprintln!("failed to log: {}", e);
            });
        }
    }

    fn flush(&self) {}
}

/// Converts `log::kv` values into JSON for the structured output.
struct KeyValueVisitor(BTreeMap<String, serde_json::Value>);

impl log::kv::Visitor<'_> for KeyValueVisitor {
    #[inline]
    fn visit_pair(
        &mut self,
        key: log::kv::Key,
        value: log::kv::Value,
    ) -> Result<(), log::kv::Error> {
        match serde_json::to_value(&value) {
            Ok(value) => {
                self.0.insert(key.to_string(), value);
                Ok(())
            }
            Err(e) => Err(log::kv::Error::boxed(e)),
        }
    }
}
