//! Startup configuration read from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::container::ContainerID;
use crate::services::EnabledServices;
use crate::trace::TracerCommand;

const DEFAULT_WINDOW_MINUTES: u64 = 5;
/// One year.
const MAX_WINDOW_MINUTES: u64 = 365 * 24 * 60;
const DEFAULT_SELF_POD_MARKER: &str = "creo-sniffer";
const DEFAULT_CACHE_SIZE: usize = 10;
const DEFAULT_TRACER_PATH: &str = "/usr/local/bin/sniffer-engine";
const DEFAULT_SBOM_COMMAND: &str = "syft";
const DEFAULT_VULN_COMMAND: &str = "grype";
const DEFAULT_API_LISTEN_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_RETAINED_CONTAINERS: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("missing required environment variable `{0}`")]
    Missing(&'static str),
    #[error("invalid value `{value}` for `{key}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub node_name: String,
    /// Observation window of every container.
    pub window: Duration,
    /// Own container id, known up front when set through the environment.
    pub self_container: Option<ContainerID>,
    /// Substring of the monitor's own pod name.
    pub self_pod_marker: String,
    pub services: EnabledServices,
    /// Number of one-second buckets in the event cache.
    pub cache_size: usize,
    pub tracer: TracerCommand,
    pub sbom_command: String,
    pub vuln_command: String,
    pub database_url: String,
    pub api_listen_addr: SocketAddr,
    /// Finished containers kept for diagnostics.
    pub retained_containers: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars(lookup);

        let window_minutes = match vars.get("SNIFFER_TIME") {
            Some(raw) => {
                let minutes: u64 = parse("SNIFFER_TIME", &raw)?;
                if minutes > MAX_WINDOW_MINUTES {
                    return Err(Error::Invalid {
                        key: "SNIFFER_TIME",
                        value: raw,
                        reason: format!("must not exceed {MAX_WINDOW_MINUTES} minutes"),
                    });
                }
                minutes
            }
            None => {
                log::warn!(
                    "`SNIFFER_TIME` is not set, observing containers for {DEFAULT_WINDOW_MINUTES} minutes"
                );
                DEFAULT_WINDOW_MINUTES
            }
        };
        let self_container = vars
            .get("MY_CONTAINER_ID")
            .map(|raw| {
                ContainerID::new(&raw).map_err(|err| Error::Invalid {
                    key: "MY_CONTAINER_ID",
                    value: raw.clone(),
                    reason: err.to_string(),
                })
            })
            .transpose()?;
        let syscall_filter = vars
            .get("TRACER_SYSCALL_FILTER")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|category| !category.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            node_name: vars.required("NODE_NAME")?,
            window: Duration::from_secs(window_minutes * 60),
            self_container,
            self_pod_marker: vars.or("SELF_POD_MARKER", DEFAULT_SELF_POD_MARKER),
            services: EnabledServices {
                relevant_cves: vars.parse_or("ENABLE_RELEVANT_CVES", true)?,
                container_profiling: vars.parse_or("ENABLE_CONTAINER_PROFILING", true)?,
            },
            cache_size: vars.parse_or("CACHE_SIZE", DEFAULT_CACHE_SIZE)?,
            tracer: TracerCommand {
                program: PathBuf::from(vars.or("TRACER_PATH", DEFAULT_TRACER_PATH)),
                syscall_filter,
                include_host: vars.parse_or("TRACER_INCLUDE_HOST", false)?,
                main_thread_only: vars.parse_or("TRACER_MAIN_THREAD_ONLY", false)?,
            },
            sbom_command: vars.or("SBOM_COMMAND", DEFAULT_SBOM_COMMAND),
            vuln_command: vars.or("VULN_COMMAND", DEFAULT_VULN_COMMAND),
            database_url: vars.required("DATABASE_URL")?,
            api_listen_addr: parse(
                "API_LISTEN_ADDR",
                &vars.or("API_LISTEN_ADDR", DEFAULT_API_LISTEN_ADDR),
            )?,
            retained_containers: vars.parse_or("RETAINED_CONTAINERS", DEFAULT_RETAINED_CONTAINERS)?,
        })
    }
}

/// Variable source; empty values count as unset.
struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String> {
        self.get(key).ok_or(Error::Missing(key))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_owned())
    }

    fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => parse(key, &raw),
            None => Ok(default),
        }
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|err: T::Err| Error::Invalid {
        key,
        value: raw.to_owned(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("NODE_NAME", "worker-1"),
        ("DATABASE_URL", "mysql://root@localhost/creo"),
    ];

    #[test]
    fn defaults() {
        let config = config(&REQUIRED).unwrap();
        assert_eq!(config.node_name, "worker-1");
        assert_eq!(config.window, Duration::from_secs(300));
        assert_eq!(config.self_container, None);
        assert_eq!(config.self_pod_marker, "creo-sniffer");
        assert!(config.services.relevant_cves && config.services.container_profiling);
        assert_eq!(config.cache_size, 10);
        assert_eq!(
            config.tracer.program,
            PathBuf::from("/usr/local/bin/sniffer-engine")
        );
        assert!(config.tracer.args().is_empty());
        assert_eq!(config.sbom_command, "syft");
        assert_eq!(config.vuln_command, "grype");
        assert_eq!(config.api_listen_addr, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.retained_containers, 128);
    }

    #[test]
    fn overrides() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("SNIFFER_TIME", "2"),
            ("MY_CONTAINER_ID", "0123456789ab"),
            ("ENABLE_RELEVANT_CVES", "false"),
            ("CACHE_SIZE", "0"),
            ("TRACER_SYSCALL_FILTER", "file, process,,"),
            ("TRACER_INCLUDE_HOST", "true"),
        ]);
        let config = config(&vars).unwrap();

        assert_eq!(config.window, Duration::from_secs(120));
        assert_eq!(
            config.self_container,
            Some(ContainerID::new("0123456789ab").unwrap())
        );
        assert!(!config.services.relevant_cves);
        assert!(config.services.container_profiling);
        assert_eq!(config.cache_size, 0);
        assert_eq!(
            config.tracer.args(),
            vec!["--filter", "file,process", "--include-host"]
        );
    }

    #[test]
    fn missing_required_variables() {
        assert_eq!(
            config(&[("NODE_NAME", "worker-1")]),
            Err(Error::Missing("DATABASE_URL"))
        );
        assert_eq!(
            config(&[("NODE_NAME", " "), REQUIRED[1]]),
            Err(Error::Missing("NODE_NAME"))
        );
    }

    #[test]
    fn malformed_values_are_rejected() {
        for (key, value) in [
            ("SNIFFER_TIME", "five"),
            ("SNIFFER_TIME", "18446744073709551615"),
            ("SNIFFER_TIME", "525601"),
            ("CACHE_SIZE", "-1"),
            ("ENABLE_CONTAINER_PROFILING", "yes"),
            ("API_LISTEN_ADDR", "localhost"),
            ("MY_CONTAINER_ID", "not-an-id!"),
        ] {
            let mut vars = REQUIRED.to_vec();
            vars.push((key, value));
            let err = config(&vars).unwrap_err();
            assert!(
                matches!(err, Error::Invalid { key: k, .. } if k == key),
                "{key}: {err}"
            );
        }
    }

    #[test]
    fn window_of_one_year_is_accepted() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("SNIFFER_TIME", "525600"));
        let config = config(&vars).unwrap();
        assert_eq!(config.window, Duration::from_secs(525_600 * 60));
    }
}
