//! Query logging module
//!
//! Runs in the logging stage, after the response has been decided, and
//! appends one line per query: timestamp, client, name, type, outcome,
//! latency and which upstream (or cache) answered.

use hickory_proto::op::Message;

use crate::config::{Config, LogFormat};
use crate::error::{ProxyError, ProxyResult};
use crate::pipeline::PluginsState;

use super::logfile::{unix_timestamp, LineWriter};
use super::{question_name, Plugin};

/// Logs every completed query
pub struct QueryLogPlugin {
    writer: Option<LineWriter>,
    format: LogFormat,
}

impl QueryLogPlugin {
    /// A module with no file opened yet
    pub fn new() -> Self {
        Self {
            writer: None,
            format: LogFormat::Tsv,
        }
    }
}

impl Default for QueryLogPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for QueryLogPlugin {
    fn name(&self) -> &'static str {
        "query_log"
    }

    fn description(&self) -> &'static str {
        "Logs DNS queries with their outcome and latency"
    }

    fn init(&mut self, config: &Config) -> ProxyResult<()> {
        let path = config
            .query_log_file
            .clone()
            .ok_or_else(|| ProxyError::config_field("no log file", "query_log_file"))?;
        self.writer = Some(LineWriter::open(&path)?);
        self.format = config.query_log_format;
        Ok(())
    }

    fn drop_resources(&mut self) -> ProxyResult<()> {
        if let Some(writer) = &self.writer {
            writer.flush()?;
        }
        Ok(())
    }

    fn eval(&self, state: &mut PluginsState, msg: &mut Message) -> ProxyResult<()> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };
        let qname = question_name(msg).unwrap_or_else(|| ".".to_string());
        let qtype = msg
            .queries()
            .first()
            .map(|q| q.query_type().to_string())
            .unwrap_or_default();
        let client = state
            .client_addr
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "-".to_string());
        let latency_ms = state
            .request_end
            .map(|end| end.duration_since(state.request_start).as_millis())
            .unwrap_or_default();
        let answered_by = if state.cache_hit {
            "cache"
        } else if state.server_name.is_empty() {
            "-"
        } else {
            state.server_name.as_str()
        };

        let line = match self.format {
            LogFormat::Tsv => format!(
                "{}\t{client}\t{qname}\t{qtype}\t{}\t{latency_ms}ms\t{answered_by}",
                unix_timestamp(),
                state.return_code,
            ),
            LogFormat::Ltsv => format!(
                "time:{}\thost:{client}\tmessage:{qname}\ttype:{qtype}\treturn:{}\tlatency:{latency_ms}\tserver:{answered_by}",
                unix_timestamp(),
                state.return_code,
            ),
        };
        writer.write_line(&line)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{query_message, state_for};
    use super::*;
    use crate::pipeline::PluginReturnCode;
    use hickory_proto::rr::RecordType;
    use std::time::Instant;

    fn plugin_for(dir: &tempfile::TempDir, format: LogFormat) -> (QueryLogPlugin, Config) {
        let path = dir.path().join("query.log");
        let config = Config {
            query_log_file: Some(path),
            query_log_format: format,
            ..Config::default()
        };
        let mut plugin = QueryLogPlugin::new();
        plugin.init(&config).unwrap();
        (plugin, config)
    }

    #[test]
    fn test_logs_query_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let (plugin, config) = plugin_for(&dir, LogFormat::Tsv);

        let mut state = state_for(&config);
        state.client_addr = Some("192.0.2.99:40000".parse().unwrap());
        state.server_name = "quad9".to_string();
        state.return_code = PluginReturnCode::Pass;
        state.request_end = Some(Instant::now());

        let mut msg = query_message("example.com.", RecordType::A);
        plugin.eval(&mut state, &mut msg).unwrap();

        let content =
            std::fs::read_to_string(config.query_log_file.as_ref().unwrap()).unwrap();
        assert!(content.contains("192.0.2.99"));
        assert!(content.contains("example.com"));
        assert!(content.contains("PASS"));
        assert!(content.contains("quad9"));
    }

    #[test]
    fn test_cache_hit_is_attributed_to_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (plugin, config) = plugin_for(&dir, LogFormat::Ltsv);

        let mut state = state_for(&config);
        state.cache_hit = true;
        state.request_end = Some(Instant::now());
        let mut msg = query_message("example.com.", RecordType::A);
        plugin.eval(&mut state, &mut msg).unwrap();

        let content =
            std::fs::read_to_string(config.query_log_file.as_ref().unwrap()).unwrap();
        assert!(content.contains("server:cache"));
    }
}
