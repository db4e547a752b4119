/*
 * Copyright (C) 2024 The FCM Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::fcm::observability::tracing;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
#[cfg(not(test))]
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

const SERVICE_NAME: &str = "firewall-controller-manager";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum LogFormat {
    #[default]
    Text = 0,
    Json = 1,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "logfmt" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unsupported log format '{other}'")),
        }
    }
}

static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Text as u8);

pub fn set_log_format(format: LogFormat) {
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
}

pub fn current_log_format() -> LogFormat {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    fn is_stderr(self) -> bool {
        matches!(self, LogLevel::Warn | LogLevel::Error)
    }
}

fn quote_if_needed(value: &str) -> String {
    let plain = !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\\' | '=' | '[' | ']' | '{' | '}' | ','));
    if plain {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        match ch {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('"');
    quoted
}

/// Ordered set of fields attached to one log line.
struct Record<'a> {
    fields: Vec<(&'a str, String)>,
}

impl<'a> Record<'a> {
    fn new(level: LogLevel, component: &'a str, message: &'a str) -> Self {
        let mut fields = vec![
            (
                "ts",
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            ("level", level.as_str().to_string()),
            ("service", SERVICE_NAME.to_string()),
            ("component", component.to_string()),
            ("pid", std::process::id().to_string()),
            ("msg", message.to_string()),
        ];
        if let Some(ctx) = tracing::current_context() {
            fields.push(("trace_id", ctx.trace_id().to_string()));
            fields.push(("span_id", ctx.span_id().to_string()));
        }
        Self { fields }
    }

    fn extend(&mut self, metadata: &[(&'a str, &str)]) {
        for (key, value) in metadata {
            if key.is_empty() {
                continue;
            }
            self.fields.push((key, (*value).to_string()));
        }
    }

    fn render(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Text => self
                .fields
                .iter()
                .map(|(key, value)| format!("{}={}", key, quote_if_needed(value)))
                .collect::<Vec<_>>()
                .join(" "),
            LogFormat::Json => {
                let mut payload = Map::new();
                for (key, value) in &self.fields {
                    payload.insert((*key).to_string(), Value::String(value.clone()));
                }
                Value::Object(payload).to_string()
            }
        }
    }
}

pub fn log_event(level: LogLevel, component: &str, message: &str, metadata: &[(&str, &str)]) {
    let mut record = Record::new(level, component, message);
    record.extend(metadata);
    write_line(level, &record.render(current_log_format()));
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Error, component, message, metadata);
}

#[cfg(not(test))]
fn write_line(level: LogLevel, line: &str) {
    let result = if level.is_stderr() {
        writeln!(io::stderr().lock(), "{}", line)
    } else {
        writeln!(io::stdout().lock(), "{}", line)
    };

    if let Err(error) = result {
        let _ = writeln!(
            io::stderr().lock(),
            "{}: failed to write log line: {} (original: {})",
            SERVICE_NAME,
            error,
            line
        );
    }
}

#[cfg(test)]
fn write_line(level: LogLevel, line: &str) {
    let _ = level.is_stderr();
    let mut guard = test_log_store()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.push((level, line.to_string()));
}

#[cfg(test)]
fn test_log_store() -> &'static Mutex<Vec<(LogLevel, String)>> {
    static STORE: OnceLock<Mutex<Vec<(LogLevel, String)>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(Vec::new()))
}

/// Removes and returns the captured log lines emitted by `component`.
#[cfg(test)]
pub(crate) fn take_test_logs(component: &str) -> Vec<(LogLevel, String)> {
    let text_needle = format!("component={component} ");
    let json_needle = format!("\"component\":\"{component}\"");
    let mut guard = test_log_store()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let (taken, kept): (Vec<_>, Vec<_>) = guard
        .drain(..)
        .partition(|(_, line)| line.contains(&text_needle) || line.contains(&json_needle));
    *guard = kept;
    taken
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcm::observability::tracing;

    // Log format is process global; both assertions live in one test.
    #[tokio::test]
    async fn records_carry_trace_ids_in_both_formats() {
        tracing::init();

        set_log_format(LogFormat::Text);
        tracing::with_span("logger-test", "text", async {
            log_info("logger-text", "reconciled", &[("namespace", "shoot a")]);
        })
        .await;
        let logs = take_test_logs("logger-text");
        assert_eq!(logs.len(), 1);
        let (level, line) = &logs[0];
        assert_eq!(*level, LogLevel::Info);
        assert!(line.contains("trace_id=") && line.contains("span_id="), "{line}");
        assert!(line.contains("namespace=\"shoot a\""), "{line}");

        set_log_format(LogFormat::Json);
        tracing::with_span("logger-test", "json", async {
            log_warn("logger-json", "slow", &[("firewall", "fw-1")]);
        })
        .await;
        let logs = take_test_logs("logger-json");
        set_log_format(LogFormat::Text);
        assert_eq!(logs.len(), 1);
        let payload: Value = serde_json::from_str(&logs[0].1).expect("json log line");
        assert_eq!(payload["component"], "logger-json");
        assert_eq!(payload["firewall"], "fw-1");
        assert_eq!(payload["service"], SERVICE_NAME);
        assert!(payload["trace_id"].as_str().is_some_and(|id| id.len() == 32));
    }

    #[test]
    fn parses_log_format_names() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("logfmt".parse::<LogFormat>(), Ok(LogFormat::Text));
        assert!("yaml".parse::<LogFormat>().is_err());
    }
}
