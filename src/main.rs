use clap::Parser;

mod cache;
mod catalog;
mod commands;
mod hub;
mod lan_api;
mod platform_api;
mod service;
mod transcode;

#[derive(clap::Parser)]
#[command(
    version,
    about = "Bridge Govee devices into a smart-home hub capability model"
)]
pub struct Args {
    #[command(flatten)]
    pub api_args: platform_api::GoveeApiArguments,

    #[command(flatten)]
    pub iot_args: service::iot::IotArguments,

    #[command(flatten)]
    pub lan_args: lan_api::LanDiscoArguments,

    #[command(subcommand)]
    cmd: SubCommand,
}

#[derive(clap::Parser)]
enum SubCommand {
    /// Run the bridge service
    Serve(commands::serve::ServeCommand),
    /// List the devices known to the account and the LAN
    List(commands::list::ListCommand),
    /// Watch LAN discovery traffic
    LanDisco(commands::lan_disco::LanDiscoCommand),
    /// Send a one-shot control command to a device
    Control(commands::control::ControlCommand),
}

impl Args {
    pub async fn run(&self) -> anyhow::Result<()> {
        match &self.cmd {
            SubCommand::Serve(cmd) => cmd.run(self).await,
            SubCommand::List(cmd) => cmd.run(self).await,
            SubCommand::LanDisco(cmd) => cmd.run(self).await,
            SubCommand::Control(cmd) => cmd.run(self).await,
        }
    }
}

/// Reads an optional environment variable, parsing it into T.
/// An unset variable is Ok(None) rather than an error.
pub fn opt_env_var<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
    <T as std::str::FromStr>::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(v) => Ok(Some(v.parse().map_err(
            |err: <T as std::str::FromStr>::Err| anyhow::anyhow!("parsing ${name}: {err}"),
        )?)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => anyhow::bail!("reading ${name}: {err}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    color_backtrace::install();
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("govee_bridge=info"),
    )
    .init();

    let args = Args::parse();
    args.run().await
}
