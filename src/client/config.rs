use crate::client::filter;
use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fs;

/// Experiment domains must match this.
static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[-_A-Za-z0-9]+$").unwrap());

pub fn valid_domain(name: &str) -> bool {
    DOMAIN_RE.is_match(name)
}

/// Per-MP overrides from the configuration file: a sampling rule and an
/// optional filter chain keyed by field name.
#[derive(Debug, Clone, Default)]
pub struct MpRule {
    pub samples: Option<u32>,
    pub interval: Option<f64>,
    pub filters: Vec<(String, String)>,
}

/// Everything the client can be told at initialisation time.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub node_id: Option<String>,
    pub domain: Option<String>,
    pub collect: Vec<String>,
    pub samples: Option<u32>,
    pub interval: Option<f64>,
    pub config_file: Option<String>,
    pub log_file: Option<String>,
    pub log_level: Option<u32>,
    pub noop: bool,
    pub mp_rules: HashMap<String, MpRule>,
}

impl Config {
    /// Consume all `--oml-*` options from the host program's argv, leaving
    /// everything else untouched. Environment variables fill the gaps, and a
    /// `--oml-config` file is loaded last.
    pub fn from_args(args: &mut Vec<String>) -> Result<Config> {
        let mut cfg = Config::default();
        let mut rest = Vec::with_capacity(args.len());
        let mut it = args.drain(..);
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--oml-id" => cfg.node_id = Some(take_value(&mut it, &arg)?),
                "--oml-domain" | "--oml-exp-id" => cfg.domain = Some(take_value(&mut it, &arg)?),
                "--oml-collect" | "--oml-server" => {
                    let uris = take_value(&mut it, &arg)?;
                    cfg.collect
                        .extend(uris.split(',').map(|s| s.trim().to_string()));
                }
                "--oml-file" => {
                    let path = take_value(&mut it, &arg)?;
                    let path = if path == "-" { "stdout".to_string() } else { path };
                    cfg.collect.push(format!("file:{}", path));
                }
                "--oml-samples" => {
                    cfg.samples = Some(
                        take_value(&mut it, &arg)?
                            .parse()
                            .context("invalid --oml-samples")?,
                    )
                }
                "--oml-interval" => {
                    let v: f64 = take_value(&mut it, &arg)?
                        .parse()
                        .context("invalid --oml-interval")?;
                    if v < 0.0 {
                        bail!("--oml-interval must be >= 0");
                    }
                    cfg.interval = Some(v);
                }
                "--oml-config" => cfg.config_file = Some(take_value(&mut it, &arg)?),
                "--oml-log-file" => cfg.log_file = Some(take_value(&mut it, &arg)?),
                "--oml-log-level" => {
                    cfg.log_level = Some(
                        take_value(&mut it, &arg)?
                            .parse()
                            .context("invalid --oml-log-level")?,
                    )
                }
                "--oml-noop" => cfg.noop = true,
                "--oml-help" => {
                    print_usage();
                    std::process::exit(0);
                }
                "--oml-list-filters" => {
                    for name in filter::filter_names() {
                        println!("\t{}", name);
                    }
                    std::process::exit(0);
                }
                _ => rest.push(arg),
            }
        }
        drop(it);
        *args = rest;

        if cfg.node_id.is_none() {
            cfg.node_id = std::env::var("OML_NAME").ok();
        }
        if cfg.domain.is_none() {
            cfg.domain = std::env::var("OML_DOMAIN")
                .or_else(|_| std::env::var("OML_EXP_ID"))
                .ok();
        }
        if cfg.config_file.is_none() {
            cfg.config_file = std::env::var("OML_CONFIG").ok();
        }
        if cfg.collect.is_empty() {
            if let Ok(uris) = std::env::var("OML_COLLECT") {
                cfg.collect
                    .extend(uris.split(',').map(|s| s.trim().to_string()));
            }
        }

        if let Some(path) = cfg.config_file.clone() {
            cfg.load_file(&path)
                .with_context(|| format!("error in configuration '{}'", path))?;
        }

        if let Some(domain) = &cfg.domain {
            if !valid_domain(domain) {
                bail!("invalid domain name '{}'", domain);
            }
        }
        Ok(cfg)
    }

    /// Load a configuration file of `key: value` lines. Options already set
    /// on the command line win; `mp:` lines add per-MP rules:
    /// `mp: <name> samples=<n>|interval=<s> [<field>:<filter> ...]`.
    pub fn load_file(&mut self, path: &str) -> Result<()> {
        let content = fs::read_to_string(path)?;
        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let colon = line
                .find(':')
                .ok_or_else(|| anyhow!("line {}: no key in <{}>", lineno + 1, line))?;
            let key = line[..colon].trim();
            let value = line[colon + 1..].trim();
            match key {
                "id" => {
                    if self.node_id.is_none() {
                        self.node_id = Some(value.to_string());
                    }
                }
                "domain" | "experiment-id" => {
                    if self.domain.is_none() {
                        self.domain = Some(value.to_string());
                    }
                }
                "collect" => {
                    if self.collect.is_empty() {
                        self.collect
                            .extend(value.split(',').map(|s| s.trim().to_string()));
                    }
                }
                "samples" => {
                    if self.samples.is_none() {
                        self.samples =
                            Some(value.parse().with_context(|| {
                                format!("line {}: bad samples value", lineno + 1)
                            })?);
                    }
                }
                "interval" => {
                    if self.interval.is_none() {
                        self.interval =
                            Some(value.parse().with_context(|| {
                                format!("line {}: bad interval value", lineno + 1)
                            })?);
                    }
                }
                "log-file" => {
                    if self.log_file.is_none() {
                        self.log_file = Some(value.to_string());
                    }
                }
                "log-level" => {
                    if self.log_level.is_none() {
                        self.log_level = Some(value.parse().with_context(|| {
                            format!("line {}: bad log-level value", lineno + 1)
                        })?);
                    }
                }
                "mp" => {
                    let rule = parse_mp_rule(value)
                        .with_context(|| format!("line {}: bad mp rule", lineno + 1))?;
                    self.mp_rules.insert(rule.0, rule.1);
                }
                other => bail!("line {}: unknown option '{}'", lineno + 1, other),
            }
        }
        Ok(())
    }

    /// Sampling rule for one MP, falling back to the global defaults. The
    /// returned pair is (threshold, interval); a threshold of 1 applies when
    /// nothing was configured at all.
    pub fn sampling_for(&self, mp_name: &str) -> (u32, f64) {
        let rule = self.mp_rules.get(mp_name);
        let interval = rule
            .and_then(|r| r.interval)
            .or(self.interval)
            .unwrap_or(0.0);
        let samples = rule.and_then(|r| r.samples).or(self.samples);
        if interval > 0.0 {
            (0, interval)
        } else {
            (samples.unwrap_or(1).max(1), 0.0)
        }
    }

    pub fn filter_override(&self, mp_name: &str, field: &str) -> Option<&str> {
        self.mp_rules.get(mp_name).and_then(|r| {
            r.filters
                .iter()
                .find(|(f, _)| f == field)
                .map(|(_, name)| name.as_str())
        })
    }
}

fn parse_mp_rule(value: &str) -> Result<(String, MpRule)> {
    let mut tokens = value.split_whitespace();
    let name = tokens
        .next()
        .ok_or_else(|| anyhow!("mp rule has no name"))?
        .to_string();
    let mut rule = MpRule::default();
    for tok in tokens {
        if let Some(v) = tok.strip_prefix("samples=") {
            rule.samples = Some(v.parse().context("bad samples= value")?);
        } else if let Some(v) = tok.strip_prefix("interval=") {
            rule.interval = Some(v.parse().context("bad interval= value")?);
        } else if let Some(i) = tok.find(':') {
            let (field, fname) = (&tok[..i], &tok[i + 1..]);
            if !filter::filter_names().iter().any(|n| *n == fname) {
                bail!("unknown filter '{}' for field '{}'", fname, field);
            }
            rule.filters.push((field.to_string(), fname.to_string()));
        } else {
            bail!("unparseable mp rule token '{}'", tok);
        }
    }
    Ok((name, rule))
}

fn take_value(it: &mut impl Iterator<Item = String>, opt: &str) -> Result<String> {
    it.next()
        .ok_or_else(|| anyhow!("missing argument for '{}'", opt))
}

fn print_usage() {
    println!("OML client options:");
    println!("  --oml-id id            node / sender identifier");
    println!("  --oml-domain domain    experiment domain (legacy: --oml-exp-id)");
    println!("  --oml-collect uris     comma-separated collection URIs (legacy: --oml-server)");
    println!("  --oml-file file        write measurements to 'file'");
    println!("  --oml-samples count    default sample threshold per MP");
    println!("  --oml-interval seconds default sampling interval");
    println!("  --oml-config file      read configuration from 'file'");
    println!("  --oml-log-file file    append diagnostic log to 'file'");
    println!("  --oml-log-level level  verbosity (error: 1 .. debug: 4)");
    println!("  --oml-noop             do not collect measurements");
    println!("  --oml-list-filters     list the available filters");
    println!("  --oml-help             print this message");
}
