use anyhow::{Context, Result, bail};
use clap::Parser;

/// Relay between an automation client and a web AI assistant tab.
#[derive(Debug, Parser)]
#[command(name = "tabchat", version, about)]
pub struct Cli {
	/// WebSocket endpoint of the automation client (ws:// or wss://)
	#[arg(long)]
	pub endpoint: Option<String>,

	/// Persist --endpoint to the config file for future runs
	#[arg(long, requires = "endpoint")]
	pub save: bool,

	/// Port for the automation-surface WebSocket listener
	#[arg(long)]
	pub listen: Option<u16>,

	/// Assistant page URL the relay controls
	#[arg(long)]
	pub assistant_url: Option<String>,

	/// Increase log verbosity (-v, -vv)
	#[arg(short, long, action = clap::ArgAction::Count)]
	pub verbose: u8,
}

pub fn validate_endpoint(endpoint: &str) -> Result<()> {
	let url = url::Url::parse(endpoint)
		.with_context(|| format!("invalid endpoint url: {endpoint}"))?;
	match url.scheme() {
		"ws" | "wss" => Ok(()),
		other => bail!("endpoint must be ws:// or wss://, got {other}://"),
	}
}

#[cfg(test)]
mod tests {
	use clap::CommandFactory;

	use super::*;

	#[test]
	fn cli_definition_is_consistent() {
		Cli::command().debug_assert();
	}

	#[test]
	fn parses_endpoint_and_verbosity() {
		let cli = Cli::parse_from(["tabchat", "--endpoint", "ws://127.0.0.1:9000", "-vv"]);
		assert_eq!(cli.endpoint.as_deref(), Some("ws://127.0.0.1:9000"));
		assert_eq!(cli.verbose, 2);
		assert!(!cli.save);
	}

	#[test]
	fn save_requires_endpoint() {
		assert!(Cli::try_parse_from(["tabchat", "--save"]).is_err());
		assert!(Cli::try_parse_from(["tabchat", "--save", "--endpoint", "ws://x:1"]).is_ok());
	}

	#[test]
	fn endpoint_scheme_is_validated() {
		assert!(validate_endpoint("ws://127.0.0.1:8761").is_ok());
		assert!(validate_endpoint("wss://relay.example/ws").is_ok());
		assert!(validate_endpoint("http://127.0.0.1:8761").is_err());
		assert!(validate_endpoint("not a url").is_err());
	}
}
