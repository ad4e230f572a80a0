//! Name blocklist module
//!
//! Rejects queries whose name matches the block-names rules file,
//! unless the allowlist marked the request first.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use hickory_proto::op::Message;
use tracing::debug;

use crate::config::Config;
use crate::error::{ProxyError, ProxyResult};
use crate::pipeline::{PluginAction, PluginReturnCode, PluginsState};

use super::matcher::{read_rules_file, NamePatterns};
use super::{is_allowed, question_name, Plugin};

/// Rejects queries for blocklisted names
pub struct BlockNamePlugin {
    patterns: ArcSwap<NamePatterns<()>>,
    path: Option<PathBuf>,
}

impl BlockNamePlugin {
    /// A module with no rules loaded yet
    pub fn new() -> Self {
        Self {
            patterns: ArcSwap::from_pointee(NamePatterns::new()),
            path: None,
        }
    }

    fn load(path: &PathBuf) -> ProxyResult<NamePatterns<()>> {
        let mut patterns = NamePatterns::new();
        for (pattern, _) in read_rules_file(path)? {
            patterns.add(&pattern, ())?;
        }
        Ok(patterns)
    }
}

impl Default for BlockNamePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for BlockNamePlugin {
    fn name(&self) -> &'static str {
        "block_name"
    }

    fn description(&self) -> &'static str {
        "Rejects queries matching name patterns from a rules file"
    }

    fn init(&mut self, config: &Config) -> ProxyResult<()> {
        let path = config
            .block_names_file
            .clone()
            .ok_or_else(|| ProxyError::config_field("no rules file", "block_names_file"))?;
        let patterns = Self::load(&path)?;
        debug!(rules = patterns.len(), file = %path.display(), "blocklist loaded");
        self.patterns.store(Arc::new(patterns));
        self.path = Some(path);
        Ok(())
    }

    fn reload(&self) -> ProxyResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        self.patterns.store(Arc::new(Self::load(path)?));
        Ok(())
    }

    fn eval(&self, state: &mut PluginsState, msg: &mut Message) -> ProxyResult<()> {
        if is_allowed(state) {
            return Ok(());
        }
        let Some(qname) = question_name(msg) else {
            return Ok(());
        };
        if self.patterns.load().lookup(&qname).is_some() {
            debug!(name = %qname, "name blocked");
            state.action = PluginAction::Reject;
            state.return_code = PluginReturnCode::Reject;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{eval_query, state_for, write_rules};
    use super::super::SESSION_ALLOWED;
    use super::*;

    fn plugin_with(rules: &[&str]) -> (BlockNamePlugin, Config, tempfile::NamedTempFile) {
        let file = write_rules(rules);
        let config = Config {
            block_names_file: Some(file.path().to_path_buf()),
            ..Config::default()
        };
        let mut plugin = BlockNamePlugin::new();
        plugin.init(&config).unwrap();
        (plugin, config, file)
    }

    #[test]
    fn test_blocks_matching_name() {
        let (plugin, config, _file) = plugin_with(&["ads.example"]);
        let mut state = state_for(&config);
        eval_query(&plugin, &mut state, "ads.example.");
        assert_eq!(state.action, PluginAction::Reject);
        assert_eq!(state.return_code, PluginReturnCode::Reject);
    }

    #[test]
    fn test_blocks_subdomain_of_pattern() {
        let (plugin, config, _file) = plugin_with(&["example.com"]);
        let mut state = state_for(&config);
        eval_query(&plugin, &mut state, "tracker.example.com.");
        assert_eq!(state.action, PluginAction::Reject);
    }

    #[test]
    fn test_passes_unrelated_name() {
        let (plugin, config, _file) = plugin_with(&["ads.example"]);
        let mut state = state_for(&config);
        eval_query(&plugin, &mut state, "good.example.");
        assert_eq!(state.action, PluginAction::Forward);
        assert_eq!(state.return_code, PluginReturnCode::Pass);
    }

    #[test]
    fn test_allowlisted_request_is_not_blocked() {
        let (plugin, config, _file) = plugin_with(&["ads.example"]);
        let mut state = state_for(&config);
        state.session_data.insert(SESSION_ALLOWED, Box::new(true));
        eval_query(&plugin, &mut state, "ads.example.");
        assert_eq!(state.action, PluginAction::Forward);
    }
}
