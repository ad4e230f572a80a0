//! Nonexistent-domain logging module
//!
//! Appends one line per `NXDOMAIN` answer. Bursts of NXDOMAIN traffic
//! are the classic signature of malware trying generated rendezvous
//! names, which makes this log worth keeping separate from the full
//! query log.

use hickory_proto::op::Message;

use crate::config::{Config, LogFormat};
use crate::error::{ProxyError, ProxyResult};
use crate::pipeline::{PluginReturnCode, PluginsState};

use super::logfile::{unix_timestamp, LineWriter};
use super::{question_name, Plugin};

/// Logs queries that resolved to `NXDOMAIN`
pub struct NxLogPlugin {
    writer: Option<LineWriter>,
    format: LogFormat,
}

impl NxLogPlugin {
    /// A module with no file opened yet
    pub fn new() -> Self {
        Self {
            writer: None,
            format: LogFormat::Tsv,
        }
    }
}

impl Default for NxLogPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for NxLogPlugin {
    fn name(&self) -> &'static str {
        "nx_log"
    }

    fn description(&self) -> &'static str {
        "Logs queries answered with NXDOMAIN"
    }

    fn init(&mut self, config: &Config) -> ProxyResult<()> {
        let path = config
            .nx_log_file
            .clone()
            .ok_or_else(|| ProxyError::config_field("no log file", "nx_log_file"))?;
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
        if state.return_code != PluginReturnCode::NXDomain {
            return Ok(());
        }
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

        let line = match self.format {
            LogFormat::Tsv => {
                format!("{}\t{client}\t{qname}\t{qtype}", unix_timestamp())
            }
            LogFormat::Ltsv => format!(
                "time:{}\thost:{client}\tmessage:{qname}\ttype:{qtype}",
                unix_timestamp()
            ),
        };
        writer.write_line(&line)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{query_message, state_for};
    use super::*;
    use hickory_proto::rr::RecordType;

    fn plugin_for(dir: &tempfile::TempDir, format: LogFormat) -> (NxLogPlugin, Config) {
        let path = dir.path().join("nx.log");
        let config = Config {
            nx_log_file: Some(path),
            query_log_format: format,
            ..Config::default()
        };
        let mut plugin = NxLogPlugin::new();
        plugin.init(&config).unwrap();
        (plugin, config)
    }

    #[test]
    fn test_logs_only_nxdomain() {
        let dir = tempfile::tempdir().unwrap();
        let (plugin, config) = plugin_for(&dir, LogFormat::Tsv);

        let mut state = state_for(&config);
        state.return_code = PluginReturnCode::Pass;
        let mut msg = query_message("exists.example.", RecordType::A);
        plugin.eval(&mut state, &mut msg).unwrap();

        state.return_code = PluginReturnCode::NXDomain;
        let mut msg = query_message("missing.example.", RecordType::A);
        plugin.eval(&mut state, &mut msg).unwrap();

        let content =
            std::fs::read_to_string(config.nx_log_file.as_ref().unwrap()).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("missing.example"));
        assert!(content.contains("\tA"));
    }

    #[test]
    fn test_ltsv_format() {
        let dir = tempfile::tempdir().unwrap();
        let (plugin, config) = plugin_for(&dir, LogFormat::Ltsv);

        let mut state = state_for(&config);
        state.return_code = PluginReturnCode::NXDomain;
        let mut msg = query_message("missing.example.", RecordType::A);
        plugin.eval(&mut state, &mut msg).unwrap();

        let content =
            std::fs::read_to_string(config.nx_log_file.as_ref().unwrap()).unwrap();
        assert!(content.starts_with("time:"));
        assert!(content.contains("message:missing.example"));
    }
}
