use std::net::SocketAddr;
use std::time::Duration;

use log::debug;
use reqwest::Client;
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::comed;
use crate::domain::ExporterError;

const ENV_PREFIX: &str = "COMED_EXPORTER_";
const DEFAULT_ADDRESS: &str = "0.0.0.0:9010";
const DEFAULT_SCHEDULE: Duration = Duration::from_secs(5 * 60);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

const USAGE: &str = "comed-exporter - exposes the comed hourly pricing as prometheus metrics

USAGE:
  comed-exporter [--address <host:port>] [--api <url>] [--schedule <duration>]

OPTIONS:
  --address <host:port>   The address to return results on (default: 0.0.0.0:9010)
  --api <url>             The comed api endpoint (default: https://hourlypricing.comed.com/api)
  --schedule <duration>   How often to query the api, e.g. 30s or 5m (default: 5m)
  -h, --help              Show this help
  -V, --version           Show version

Every option can also be set through COMED_EXPORTER_ADDRESS, COMED_EXPORTER_API
and COMED_EXPORTER_SCHEDULE, or a .env file. Flags win over the environment.
";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Config {
    pub(crate) listen_address: SocketAddr,
    pub(crate) endpoint: Url,
    pub(crate) interval: Duration,
}

/// What the process was asked to do on the command line.
#[derive(Debug, PartialEq)]
pub(crate) enum Invocation {
    Run(Config),
    Help,
    Version,
}

impl Invocation {
    pub(crate) fn usage() -> &'static str {
        USAGE
    }
}

/// Reads `.env`, the process environment and the command line, in that order of precedence
/// (lowest first).
pub(crate) fn load_invocation() -> Result<Invocation, ExporterError> {
    if let Ok(path) = dotenv::dotenv() {
        debug!("loaded environment from {}", path.display());
    }

    parse_invocation(std::env::args().skip(1), |key| std::env::var(key).ok())
}

pub(crate) fn parse_invocation<A, E>(args: A, env: E) -> Result<Invocation, ExporterError>
where
    A: IntoIterator<Item = String>,
    E: Fn(&str) -> Option<String>,
{
    let mut address = env_value(&env, "ADDRESS");
    let mut api = env_value(&env, "API");
    let mut schedule = env_value(&env, "SCHEDULE");

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };

        let slot = match flag.as_str() {
            "-h" | "--help" => return Ok(Invocation::Help),
            "-V" | "--version" => return Ok(Invocation::Version),
            "--address" => &mut address,
            "--api" => &mut api,
            "--schedule" => &mut schedule,
            other => {
                return Err(ExporterError::Config(format!("unknown argument '{other}'")));
            }
        };

        let value = match inline {
            Some(value) => value,
            None => args
                .next()
                .ok_or_else(|| ExporterError::Config(format!("{flag} expects a value")))?,
        };
        *slot = Some(value);
    }

    let listen_address = address
        .as_deref()
        .unwrap_or(DEFAULT_ADDRESS)
        .parse::<SocketAddr>()
        .map_err(|e| ExporterError::Config(format!("invalid address: {e}")))?;

    let endpoint = Url::parse(api.as_deref().unwrap_or(comed::ADDRESS))
        .map_err(|e| ExporterError::Config(format!("invalid api endpoint: {e}")))?;

    let interval = match schedule {
        Some(schedule) => humantime::parse_duration(&schedule)
            .map_err(|e| ExporterError::Config(format!("invalid schedule '{schedule}': {e}")))?,
        None => DEFAULT_SCHEDULE,
    };
    if interval.is_zero() {
        return Err(ExporterError::Config(
            "schedule must be greater than zero".to_string(),
        ));
    }

    Ok(Invocation::Run(Config {
        listen_address,
        endpoint,
        interval,
    }))
}

fn env_value<E>(env: &E, key: &str) -> Option<String>
where
    E: Fn(&str) -> Option<String>,
{
    env(&format!("{ENV_PREFIX}{key}")).filter(|value| !value.trim().is_empty())
}

pub(crate) fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// The http client used for every feed request; the timeout also bounds how long a
/// shutdown waits on a cycle in flight.
pub(crate) fn build_client() -> Result<Client, ExporterError> {
    Ok(Client::builder().timeout(CLIENT_TIMEOUT).build()?)
}
