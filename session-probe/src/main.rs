use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

use device_session::logging::{self, LoggingMode};
use device_session::session_codec::{JsonRpcCodec, Request};
use device_session::session_transport::TcpLineTransport;
use device_session::{
    ChannelSessionListener, Credentials, LoginHandshake, ProbeHandshake, SessionConfig,
    SessionEvent, SessionManager,
};

/// Device Session Probe
///
/// Connects to a device speaking newline-delimited JSON-RPC, performs one
/// call, prints the response and then prints every notification the device
/// sends during the listen window.
#[derive(Parser, Debug)]
#[command(name = "session-probe")]
#[command(about = "Probe a JSON-RPC device: one call, then watch its notifications")]
#[command(version)]
pub struct Args {
    /// Device address as host:port
    #[arg(short, long)]
    pub address: String,

    /// Method to call
    #[arg(short, long, default_value = "JSONRPC.Version")]
    pub method: String,

    /// Call parameters as JSON
    #[arg(short, long)]
    pub params: Option<String>,

    /// Seconds to print notifications after the call (0 to exit at once)
    #[arg(short, long, default_value = "0")]
    pub listen: u64,

    /// Call and connect timeout in seconds
    #[arg(short, long, default_value = "10")]
    pub timeout: u64,

    /// Method run on connect to verify the device before the call
    #[arg(long)]
    pub probe_method: Option<String>,

    /// Login method used when credentials are given
    #[arg(long, default_value = "Session.Login")]
    pub login_method: String,

    #[arg(short, long)]
    pub username: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Validate command line arguments
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(anyhow::anyhow!("Device address must not be empty"));
        }

        if self.method.trim().is_empty() {
            return Err(anyhow::anyhow!("Method must not be empty"));
        }

        if self.timeout == 0 {
            return Err(anyhow::anyhow!("Timeout must be positive"));
        }

        if self.username.is_some() != self.password.is_some() {
            return Err(anyhow::anyhow!(
                "--username and --password must be given together"
            ));
        }

        self.parsed_params()?;

        match self.log_level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
                    self.log_level
                ));
            }
        }

        Ok(())
    }

    /// Parameters for the call, `null` when none were given
    pub fn parsed_params(&self) -> Result<Value> {
        match &self.params {
            Some(raw) => serde_json::from_str(raw).context("--params is not valid JSON"),
            None => Ok(Value::Null),
        }
    }

    pub fn credentials(&self) -> Credentials {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Credentials::basic(username, password),
            _ => Credentials::none(),
        }
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Source locations and thread ids are shown from `debug` up
    pub fn logging_mode(&self) -> LoggingMode {
        match self.log_level.to_lowercase().as_str() {
            "debug" | "trace" => LoggingMode::Debug,
            _ => LoggingMode::Development,
        }
    }
}

/// Log at `--log-level` unless DEVICE_SESSION_LOG_LEVEL or RUST_LOG say otherwise
fn init_tracing(args: &Args) -> Result<()> {
    logging::init_logging_at(args.logging_mode(), &args.log_level.to_lowercase())
        .context("Failed to set up logging")
}

fn build_session(args: &Args) -> Result<SessionManager> {
    let config = SessionConfig::no_reconnect(&args.address)
        .with_connect_timeout(args.timeout_duration())
        .with_call_timeout(args.timeout_duration());

    let mut builder = SessionManager::builder(config)
        .with_transport(TcpLineTransport::new())
        .with_codec(JsonRpcCodec::new());

    if args.username.is_some() {
        builder = builder.with_handshake(LoginHandshake::new(&args.login_method));
    } else if let Some(method) = &args.probe_method {
        builder = builder.with_handshake(ProbeHandshake::new(method));
    }

    builder.build().context("Invalid session configuration")
}

async fn run(args: Args) -> Result<()> {
    let session = build_session(&args)?;
    let (listener, mut events) = ChannelSessionListener::new();
    session.add_listener(std::sync::Arc::new(listener));

    info!("Connecting to {}", args.address);
    session
        .connect(args.credentials(), args.timeout_duration())
        .await
        .with_context(|| format!("Failed to connect to {}", args.address))?;

    let request = Request::with_params(&args.method, args.parsed_params()?);
    let response = session
        .call(request, args.timeout_duration())
        .await
        .with_context(|| format!("Call to {} failed", args.method))?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    if args.listen > 0 {
        info!("Listening for notifications for {}s", args.listen);
        let deadline = tokio::time::sleep(Duration::from_secs(args.listen));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => match event {
                    Some(SessionEvent::Notification { topic, payload }) => {
                        println!("{} {}", topic, payload);
                    }
                    Some(SessionEvent::StateChanged { previous, current }) => {
                        info!("Connection {} -> {}", previous, current);
                    }
                    Some(SessionEvent::FatalError { message, .. }) => {
                        warn!("Session failed: {}", message);
                        break;
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }

    let stats = session.stats();
    info!("{}", stats);
    session.disconnect().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.validate()?;
    init_tracing(&args)?;
    run(args).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(argv: &[&str]) -> Args {
        let mut full = vec!["session-probe"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["--address", "10.0.0.5:9090"]);
        assert_eq!(args.method, "JSONRPC.Version");
        assert_eq!(args.listen, 0);
        assert_eq!(args.parsed_params().unwrap(), Value::Null);
        assert!(args.credentials().is_empty());
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_params_are_parsed() {
        let args = parse(&[
            "-a",
            "kodi:9090",
            "-m",
            "Application.SetVolume",
            "--params",
            r#"{"volume": 20}"#,
        ]);
        assert_eq!(args.parsed_params().unwrap()["volume"], 20);
    }

    #[rstest]
    #[case(&["--address", ""])]
    #[case(&["--address", "kodi:9090", "--params", "{not json"])]
    #[case(&["--address", "kodi:9090", "--timeout", "0"])]
    #[case(&["--address", "kodi:9090", "--username", "admin"])]
    #[case(&["--address", "kodi:9090", "--log-level", "loud"])]
    fn test_invalid_arguments(#[case] argv: &[&str]) {
        assert!(parse(argv).validate().is_err());
    }

    #[rstest]
    #[case("error", LoggingMode::Development)]
    #[case("INFO", LoggingMode::Development)]
    #[case("debug", LoggingMode::Debug)]
    #[case("trace", LoggingMode::Debug)]
    fn test_log_level_selects_mode(#[case] level: &str, #[case] mode: LoggingMode) {
        let args = parse(&["-a", "kodi:9090", "--log-level", level]);
        assert!(args.validate().is_ok());
        assert_eq!(args.logging_mode(), mode);
    }

    #[test]
    fn test_credentials_require_both_parts() {
        let args = parse(&["-a", "ihc:443", "-u", "admin", "--password", "secret"]);
        assert!(args.validate().is_ok());
        assert!(!args.credentials().is_empty());
    }
}
