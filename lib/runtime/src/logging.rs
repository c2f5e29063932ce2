// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide `tracing` setup.
//!
//! Settings are layered, later sources winning:
//!   1. built-in defaults;
//!   2. `/opt/canopy/etc/logging.toml`;
//!   3. the TOML file named by `CANOPY_LOGGING_CONFIG_PATH`;
//!   4. `CANOPY_LOG`, an `EnvFilter` directive string.
//!
//! Output is compact text on stderr, or one JSON object per line when
//! `CANOPY_LOGGING_JSONL` is truthy. Timestamps are UTC unless
//! `CANOPY_LOG_USE_LOCAL_TZ` is set.
//!
//! ```toml
//! level = "warn"
//!
//! [modules]
//! "canopy_runtime::remote" = "debug"
//! "canopy_group" = "trace"
//! ```

use std::collections::BTreeMap;
use std::sync::Once;

use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::{Directive, EnvFilter, LevelFilter};
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

const FILTER_ENV: &str = "CANOPY_LOG";
const CONFIG_PATH_ENV: &str = "CANOPY_LOGGING_CONFIG_PATH";
const SYSTEM_CONFIG: &str = "/opt/canopy/etc/logging.toml";
const JSONL_ENV: &str = "CANOPY_LOGGING_JSONL";
const LOCAL_TZ_ENV: &str = "CANOPY_LOG_USE_LOCAL_TZ";

static INIT: Once = Once::new();

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LogSettings {
    level: String,
    modules: BTreeMap<String, String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            modules: [("tokio_util", "error"), ("mio", "error")]
                .into_iter()
                .map(|(module, level)| (module.to_string(), level.to_string()))
                .collect(),
        }
    }
}

impl LogSettings {
    fn load() -> Self {
        let mut figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(SYSTEM_CONFIG));
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }
        figment.extract().unwrap_or_else(|e| {
            eprintln!("ignoring invalid logging settings: {e}");
            Self::default()
        })
    }

    /// `CANOPY_LOG` first, then one directive per configured module.
    fn filter(&self) -> EnvFilter {
        let default = self
            .level
            .parse::<Directive>()
            .unwrap_or_else(|_| LevelFilter::INFO.into());

        let base = EnvFilter::builder()
            .with_default_directive(default)
            .with_env_var(FILTER_ENV)
            .from_env_lossy();

        self.modules
            .iter()
            .fold(base, |filter, (module, level)| {
                match format!("{module}={level}").parse::<Directive>() {
                    Ok(directive) => filter.add_directive(directive),
                    Err(e) => {
                        eprintln!("skipping log filter {module}={level}: {e}");
                        filter
                    }
                }
            })
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .is_ok_and(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "on" | "yes"))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        let filter = LogSettings::load().filter();
        let clock = Clock::from_env();

        let layer = if env_flag(JSONL_ENV) {
            fmt::layer()
                .with_ansi(false)
                .with_writer(std::io::stderr)
                .event_format(JsonLines { clock })
                .boxed()
        } else {
            fmt::layer()
                .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
                .with_writer(std::io::stderr)
                .event_format(fmt::format().compact().with_timer(clock))
                .boxed()
        };
        let _ = tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init();
    });
}

#[derive(Debug, Clone, Copy)]
struct Clock {
    local: bool,
}

impl Clock {
    fn from_env() -> Self {
        Self {
            local: env_flag(LOCAL_TZ_ENV),
        }
    }

    fn now(&self) -> String {
        if self.local {
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string()
        } else {
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
        }
    }
}

impl FormatTime for Clock {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", self.now())
    }
}

/// One JSON object per event.
struct JsonLines {
    clock: Clock,
}

impl<S, N> FormatEvent<S, N> for JsonLines
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let mut line = Map::new();
        line.insert("time".into(), self.clock.now().into());
        line.insert("level".into(), metadata.level().to_string().into());
        line.insert("target".into(), metadata.target().into());
        if let Some(span) = ctx.lookup_current() {
            line.insert("span".into(), span.name().into());
        }
        event.record(&mut FieldMap(&mut line));

        let json = serde_json::to_string(&line).map_err(|_| std::fmt::Error)?;
        writeln!(writer, "{json}")
    }
}

/// Event fields as JSON values. Types without their own hook arrive
/// through `record_debug`.
struct FieldMap<'a>(&'a mut Map<String, Value>);

impl Visit for FieldMap<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().into(), format!("{value:?}").into());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().into(), value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_directives_are_applied() {
        let mut settings = LogSettings::default();
        settings
            .modules
            .insert("canopy_group".to_string(), "trace".to_string());

        let rendered = temp_env::with_var_unset(FILTER_ENV, || settings.filter().to_string());
        assert!(rendered.contains("tokio_util=error"));
        assert!(rendered.contains("canopy_group=trace"));
    }

    #[test]
    fn test_bad_entries_are_skipped() {
        let settings = LogSettings {
            level: "not-a-level".to_string(),
            modules: BTreeMap::from([("canopy_group".to_string(), "loud".to_string())]),
        };
        let rendered = temp_env::with_var_unset(FILTER_ENV, || settings.filter().to_string());
        assert!(!rendered.contains("canopy_group"));
    }

    #[test]
    fn test_settings_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("canopy-logging-{}.toml", std::process::id()));
        std::fs::write(&path, "level = \"warn\"\n[modules]\ncanopy_runtime = \"debug\"\n").unwrap();

        let settings = temp_env::with_var(CONFIG_PATH_ENV, Some(&path), LogSettings::load);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(settings.level, "warn");
        assert_eq!(settings.modules["canopy_runtime"], "debug");
        assert_eq!(settings.modules["mio"], "error");
    }

    #[test]
    fn test_env_flag() {
        temp_env::with_var(JSONL_ENV, Some("TRUE"), || assert!(env_flag(JSONL_ENV)));
        temp_env::with_var(JSONL_ENV, Some("0"), || assert!(!env_flag(JSONL_ENV)));
        temp_env::with_var_unset(JSONL_ENV, || assert!(!env_flag(JSONL_ENV)));
    }

    #[test]
    fn test_clock_is_utc_by_default() {
        temp_env::with_var_unset(LOCAL_TZ_ENV, || {
            assert!(Clock::from_env().now().ends_with('Z'));
        });
    }

    #[tokio::test]
    async fn test_init_twice() {
        init();
        init();
        tracing::info!(component = "logging", "logger initialized");
    }
}
