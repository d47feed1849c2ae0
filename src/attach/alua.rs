//! ALUA Path-Priority Policy
//!
//! Backends may configure per-host ALUA settings keyed by host name or glob
//! pattern:
//!
//! ```yaml
//! ALUA:
//!   "node-1": { MULTIPATHTYPE: 1, FAILOVERMODE: 3, PATHTYPE: 0 }
//!   "node-*": { MULTIPATHTYPE: 1, FAILOVERMODE: 1, PATHTYPE: 1 }
//!   "*":      { MULTIPATHTYPE: 0 }
//! ```
//!
//! An exact host name beats a pattern, a longer pattern beats a shorter one,
//! and `*` applies when nothing else matches.

use crate::error::{Error, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

const WILDCARD: &str = "*";

/// Path-priority settings applied to one host object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AluaConfig {
    #[serde(rename = "MULTIPATHTYPE", default, skip_serializing_if = "Option::is_none")]
    pub multipath_type: Option<u8>,
    #[serde(rename = "FAILOVERMODE", default, skip_serializing_if = "Option::is_none")]
    pub failover_mode: Option<u8>,
    #[serde(rename = "SPECIALMODETYPE", default, skip_serializing_if = "Option::is_none")]
    pub special_mode_type: Option<u8>,
    #[serde(rename = "PATHTYPE", default, skip_serializing_if = "Option::is_none")]
    pub path_type: Option<u8>,
}

impl AluaConfig {
    fn from_value(host: &str, value: &Value) -> Result<Self> {
        let Value::Object(fields) = value else {
            return Err(invalid(format!("settings for host {} must be a map", host)));
        };

        let mut config = AluaConfig::default();
        for (key, raw) in fields {
            let parsed = match raw {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse::<u64>().ok(),
                _ => None,
            }
            .ok_or_else(|| invalid(format!("{} of host {} must be an integer", key, host)))?;

            let (slot, max) = match key.as_str() {
                "MULTIPATHTYPE" => (&mut config.multipath_type, 1),
                "FAILOVERMODE" => (&mut config.failover_mode, 3),
                "SPECIALMODETYPE" => (&mut config.special_mode_type, 3),
                "PATHTYPE" => (&mut config.path_type, 1),
                other => {
                    return Err(invalid(format!("unknown key {} for host {}", other, host)));
                }
            };
            if parsed > max {
                return Err(invalid(format!(
                    "{}={} of host {} is out of range 0..={}",
                    key, parsed, host, max
                )));
            }
            *slot = Some(parsed as u8);
        }

        // third-party multipathing needs an explicit failover mode
        if config.multipath_type == Some(1) && config.failover_mode.is_none() {
            return Err(invalid(format!(
                "host {} sets MULTIPATHTYPE=1 without FAILOVERMODE",
                host
            )));
        }
        Ok(config)
    }
}

fn invalid(reason: String) -> Error {
    Error::InvalidParameter {
        name: "ALUA".to_string(),
        reason,
    }
}

#[derive(Debug, Clone)]
struct PatternRule {
    pattern: Pattern,
    /// Number of literal characters, used for specificity
    literal_len: usize,
    config: AluaConfig,
}

/// Host name → ALUA settings resolver
#[derive(Debug, Clone, Default)]
pub struct AluaPolicy {
    exact: BTreeMap<String, AluaConfig>,
    patterns: Vec<PatternRule>,
    fallback: Option<AluaConfig>,
}

impl AluaPolicy {
    /// Parse the `ALUA` parameter; accepts a map or a JSON-encoded map
    pub fn from_value(value: &Value) -> Result<Self> {
        let decoded;
        let value = match value {
            Value::String(raw) => {
                decoded = serde_json::from_str::<Value>(raw)
                    .map_err(|e| invalid(format!("not valid JSON: {}", e)))?;
                &decoded
            }
            other => other,
        };
        let Value::Object(hosts) = value else {
            return Err(invalid("must map host names to settings".to_string()));
        };

        let mut policy = AluaPolicy::default();
        for (host, settings) in hosts {
            let config = AluaConfig::from_value(host, settings)?;
            if host == WILDCARD {
                policy.fallback = Some(config);
            } else if host.contains(['*', '?', '[']) {
                let pattern = Pattern::new(host)
                    .map_err(|e| invalid(format!("bad host pattern {}: {}", host, e)))?;
                let literal_len = host.chars().filter(|c| !matches!(c, '*' | '?' | '[' | ']')).count();
                policy.patterns.push(PatternRule {
                    pattern,
                    literal_len,
                    config,
                });
            } else {
                policy.exact.insert(host.clone(), config);
            }
        }

        policy.patterns.sort_by(|a, b| {
            b.literal_len
                .cmp(&a.literal_len)
                .then_with(|| a.pattern.as_str().cmp(b.pattern.as_str()))
        });
        Ok(policy)
    }

    /// Settings for a host, if any rule applies
    pub fn resolve(&self, host: &str) -> Option<&AluaConfig> {
        self.exact
            .get(host)
            .or_else(|| {
                self.patterns
                    .iter()
                    .find(|rule| rule.pattern.matches(host))
                    .map(|rule| &rule.config)
            })
            .or(self.fallback.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty() && self.fallback.is_none()
    }
}
